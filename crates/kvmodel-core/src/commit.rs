//! Commit payloads sent to the backend and the per-instance outcomes
//! reported back to callers.

use std::fmt;

use crate::catalog::{ModelKeys, ModelMeta};
use crate::error::{BackendError, Error};
use crate::record::Record;
use crate::state::{IdentityKey, TransactionId};

/// An indexed field as the commit script sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
}

/// One serialized instance to write.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceWrite {
    /// Session identity key, echoed back in the reply
    pub identity: IdentityKey,
    /// Backend id; `None` asks the script to assign one
    pub id: Option<String>,
    /// Encoded record pairs, identity excluded
    pub fields: Vec<(String, String)>,
    /// Encoded values of indexed fields that are not `Null`
    pub index_values: Vec<(String, String)>,
    /// Sorted-set score for ordered models
    pub score: Option<f64>,
    /// Version the instance was loaded with, for versioned models
    pub expected_version: Option<i64>,
}

impl InstanceWrite {
    /// Serialize a record of `meta`'s model.
    pub fn from_record(
        meta: &ModelMeta,
        identity: IdentityKey,
        record: &Record,
        expected_version: Option<i64>,
    ) -> Self {
        let id = record
            .get(meta.identity.name)
            .and_then(|v| meta.identity.field_type.encode(v));
        let index_values = meta
            .indexed_fields()
            .filter_map(|info| {
                let value = meta.index_value(info, record.get(info.name)?)?;
                Some((info.name.to_string(), value))
            })
            .collect();
        Self {
            identity,
            id,
            fields: record.to_hash(meta),
            index_values,
            score: meta.score(record),
            expected_version,
        }
    }

    /// Encoded index value of `field`, if it has one.
    pub fn index_value(&self, field: &str) -> Option<&str> {
        self.index_values
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }
}

/// Where the ids of a delete come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSource {
    /// Explicit ids
    Ids(Vec<String>),
    /// Members of a key computed earlier in the same pipeline
    Key(String),
}

/// Everything one model contributes to a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCommit {
    pub model: String,
    pub keys: ModelKeys,
    /// Identity field name; the script stores the id under it
    pub identity: String,
    pub indices: Vec<IndexSpec>,
    pub ordered: bool,
    pub auto_id: bool,
    pub version_field: Option<String>,
    pub structures: Vec<String>,
    pub writes: Vec<InstanceWrite>,
    pub deletes: Vec<DeleteSource>,
}

impl ModelCommit {
    pub fn new(meta: &ModelMeta) -> Self {
        Self {
            model: meta.name.to_string(),
            keys: meta.keys.clone(),
            identity: meta.identity.name.to_string(),
            indices: meta
                .indexed_fields()
                .map(|f| IndexSpec {
                    field: f.name.to_string(),
                    unique: f.unique,
                })
                .collect(),
            ordered: meta.is_ordered(),
            auto_id: meta.auto_id,
            version_field: meta.version_field.map(str::to_string),
            structures: meta.structures.iter().map(|s| (*s).to_string()).collect(),
            writes: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Successful write of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub id: String,
    /// Stored version after the write, for versioned models
    pub version: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct WriteReply {
    pub identity: IdentityKey,
    pub result: Result<WriteAck, BackendError>,
}

/// Reply of the commit script for one model.
#[derive(Debug, Clone, Default)]
pub struct CommitReply {
    pub writes: Vec<WriteReply>,
    /// Ids whose records were removed
    pub deleted: Vec<String>,
    /// Ids left untouched because a key they own has the wrong kind
    pub failed_deletes: Vec<(String, BackendError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Write,
    Delete,
}

/// Result of committing one instance.
#[derive(Debug)]
pub struct InstanceOutcome {
    pub model: String,
    pub key: IdentityKey,
    pub id: Option<String>,
    pub action: CommitAction,
    pub error: Option<Error>,
}

impl InstanceOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-instance outcome list of one transaction.
#[derive(Debug)]
pub struct CommitReport {
    pub transaction: TransactionId,
    pub outcomes: Vec<InstanceOutcome>,
    /// Errors returned by after-commit / after-delete handlers
    pub notification_errors: Vec<Error>,
}

impl CommitReport {
    pub fn new(transaction: TransactionId) -> Self {
        Self {
            transaction,
            outcomes: Vec::new(),
            notification_errors: Vec::new(),
        }
    }

    pub fn committed(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &InstanceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    pub fn is_success(&self) -> bool {
        self.failure_count() == 0
    }
}

impl fmt::Display for CommitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} committed, {} failed",
            self.transaction,
            self.outcomes.len() - self.failure_count(),
            self.failure_count()
        )?;
        for outcome in self.failed() {
            if let Some(err) = &outcome.error {
                write!(f, "; {}[{}]: {}", outcome.model, outcome.key, err)?;
            }
        }
        Ok(())
    }
}
