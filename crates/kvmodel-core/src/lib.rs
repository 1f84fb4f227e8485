//! Core types and traits for kvmodel.
//!
//! This crate provides the foundational abstractions for mapping typed
//! models onto a key-value store:
//!
//! - `Model` trait and `FieldInfo` registry for struct mapping
//! - `ModelCatalog` resolving key layout per registered model
//! - `Connector` trait, `Command` and `Reply` for the backend contract
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod catalog;
pub mod commit;
pub mod config;
pub mod connector;
pub mod error;
pub mod field;
pub mod model;
pub mod record;
pub mod state;
pub mod types;
pub mod validate;
pub mod value;

pub use catalog::{ModelCatalog, ModelKeys, ModelMeta, Ordering};
pub use commit::{
    CommitAction, CommitReply, CommitReport, DeleteSource, IndexSpec, InstanceOutcome,
    InstanceWrite, ModelCommit, WriteAck, WriteReply,
};
pub use config::BackendConfig;
pub use connector::{Aggregate, Command, Connector, Reply, Script};
pub use error::{
    BackendError, BackendErrorKind, CommitError, ConfigError, ConnectionError,
    ConnectionErrorKind, ConsistencyError, Error, FieldValidationError, QueryError,
    QueryErrorKind, Result, SchemaError, SchemaErrorKind, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use field::{FieldInfo, FieldValue};
pub use model::Model;
pub use record::Record;
pub use state::{IdentityKey, InstanceState, SessionId, TransactionId};
pub use types::FieldType;
pub use value::Value;

/// Unwrap an `Outcome::Ok`, returning any other outcome from the
/// enclosing function.
///
/// `Result` values can be lifted with `try_outcome!(@result expr)`.
#[macro_export]
macro_rules! try_outcome {
    (@result $expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(v) => v,
            ::core::result::Result::Err(e) => return $crate::Outcome::Err(e),
        }
    };
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}
