//! kvmodel - typed models and declarative queries over a key-value store.
//!
//! kvmodel maps Rust structs onto hashes, sets and sorted sets of a
//! Redis-style store, providing:
//!
//! - `#[derive(Model)]` for the static field registry and record conversion
//! - Lazy, immutable query builders lowered into server-side set algebra
//! - Sessions with an identity map and atomic multi-model commits
//! - An in-memory connector for tests and embedded use
//!
//! # Quick Start
//!
//! ```ignore
//! use kvmodel::prelude::*;
//!
//! #[derive(Model, Debug, Clone)]
//! #[kvmodel(ordering = "score")]
//! struct Hero {
//!     #[kvmodel(primary_key, auto)]
//!     id: Option<i64>,
//!     name: String,
//!     #[kvmodel(index)]
//!     team: String,
//!     score: i64,
//!     #[kvmodel(state)]
//!     state: InstanceState,
//! }
//!
//! async fn example(cx: &Cx) -> Result<()> {
//!     let store = StoreBuilder::new()
//!         .register::<Hero>()
//!         .build(MemoryConnector::default())?;
//!
//!     let mut session = store.session();
//!     session.add(Hero { id: None, name: "Ada".into(), team: "red".into(), score: 3, state: InstanceState::new() })?;
//!     session.commit(cx).await;
//!
//!     let best = store
//!         .query::<Hero>()?
//!         .filter("team", "red")
//!         .sort_by("-score")
//!         .first(cx)
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Atomic commits**: one pipeline per transaction, one server-side script per model
//! - **Partial failure reporting**: per-instance outcomes, failed instances stay pending
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Bounded temporaries**: every temporary query key carries a TTL

pub mod store;

pub use store::{Store, StoreBuilder};

pub use kvmodel_core::{
    BackendConfig, BackendError, BackendErrorKind, Budget, Command, CommitAction, CommitError,
    CommitReport, Connector, Cx, Error, FieldInfo, FieldType, FieldValue, IdentityKey,
    InstanceOutcome, InstanceState, Model, ModelCatalog, ModelMeta, Ordering, Outcome,
    QueryErrorKind, Record, RegionId, Reply, Result, SessionId, TaskId, TransactionErrorKind,
    TransactionId, ValidationError, ValidationErrorKind, Value, try_outcome,
};

pub use kvmodel_macros::Model;

pub use kvmodel_query::{
    BackendQuery, Combinator, CombinatorKind, Compound, Lookup, Plan, Query, Reader,
    SearchEngine, TermIndex,
};

pub use kvmodel_session::{
    CommitEvent, CommitEventKind, EventInstance, Partition, Session, SessionConfig,
    SessionModel, Transaction, TransactionStatus,
};

pub use kvmodel_memory::{Clock, KeyKind, ManualClock, MemoryConfig, MemoryConnector, MemoryStats};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use kvmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Core traits and types (Model is both the trait and the derive)
        Error,
        FieldValue,
        InstanceState,
        Model,
        ModelCatalog,
        Record,
        Result,
        Value,
        // Query
        Query,
        // Session
        CommitEvent,
        CommitReport,
        Session,
        SessionConfig,
        // Entry points
        MemoryConnector,
        Store,
        StoreBuilder,
    };
}
