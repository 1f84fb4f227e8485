//! Model trait for typed records stored in the key-value backend.
//!
//! The `Model` trait is the contract between application structs and the
//! mapper. It is typically derived using `#[derive(Model)]` from
//! `kvmodel-macros`.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Model, Clone, Debug, Default)]
//! #[kvmodel(name = "planet", ordering = "-score")]
//! struct Planet {
//!     #[kvmodel(primary_key, auto)]
//!     id: Option<i64>,
//!     #[kvmodel(index)]
//!     group: String,
//!     score: i64,
//!     #[kvmodel(state)]
//!     state: InstanceState,
//! }
//! ```

use crate::Result;
use crate::error::ValidationError;
use crate::field::FieldInfo;
use crate::record::Record;
use crate::state::{IdentityKey, InstanceState};

/// Trait for types that map to records in the key-value store.
pub trait Model: Sized + Send + Sync + Clone + 'static {
    /// Name used in every key of this model.
    const MODEL_NAME: &'static str;

    /// Default storage ordering: `"field"` or `"-field"`.
    ///
    /// When set, the id collection and every index are sorted sets scored
    /// by this field.
    const ORDERING: Option<&'static str> = None;

    /// Names of structured containers owned by each instance. They are
    /// deleted together with the instance.
    const STRUCTURES: &'static [&'static str] = &[];

    /// Field descriptors in declaration order.
    fn fields() -> &'static [FieldInfo];

    /// Backend id in string form, `None` until assigned.
    fn primary_key(&self) -> Option<String>;

    /// Store a backend-assigned id.
    fn set_primary_key(&mut self, id: &str) -> Result<()>;

    /// All field values, identity included.
    fn to_record(&self) -> Record;

    /// Build an instance from a record. `id` is empty for instances not
    /// written yet.
    fn from_record(id: &str, record: &Record) -> Result<Self>;

    fn state(&self) -> &InstanceState;

    fn state_mut(&mut self) -> &mut InstanceState;

    /// Current optimistic version, for models that declare one.
    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    /// Model-level validation run before serialization.
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    fn identity_key(&self) -> IdentityKey {
        self.state().identity_key(self.primary_key().as_deref())
    }
}
