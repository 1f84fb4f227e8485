//! Per-instance lifecycle bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransactionErrorKind};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Process-unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

const PLACEHOLDER_PREFIX: &str = "new:";

/// Key addressing an instance inside a session model.
///
/// The backend id once the instance is persistent, otherwise a locally
/// unique placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Key for a persisted instance.
    pub fn persistent(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    fn placeholder() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{PLACEHOLDER_PREFIX}{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state carried by every model instance.
///
/// Invariant: `deleted` implies `persistent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    persistent: bool,
    deleted: bool,
    session: Option<SessionId>,
    placeholder: IdentityKey,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// State of an instance created by application code.
    pub fn new() -> Self {
        Self {
            persistent: false,
            deleted: false,
            session: None,
            placeholder: IdentityKey::placeholder(),
        }
    }

    /// State of an instance read back from the store.
    pub fn loaded() -> Self {
        Self {
            persistent: true,
            ..Self::new()
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn placeholder(&self) -> &IdentityKey {
        &self.placeholder
    }

    /// Identity key given the instance's current backend id.
    pub fn identity_key(&self, id: Option<&str>) -> IdentityKey {
        match id {
            Some(id) if self.persistent => IdentityKey::persistent(id),
            _ => self.placeholder.clone(),
        }
    }

    pub fn mark_persistent(&mut self) {
        self.persistent = true;
        self.deleted = false;
    }

    /// Flag the instance for deletion; only persisted instances qualify.
    pub fn mark_deleted(&mut self) -> Result<()> {
        if !self.persistent {
            return Err(Error::consistency(
                "cannot mark a non-persistent instance deleted",
            ));
        }
        self.deleted = true;
        Ok(())
    }

    pub fn clear_deleted(&mut self) {
        self.deleted = false;
    }

    /// Instance is gone from the store; it may be added again as new.
    pub fn mark_removed(&mut self) {
        self.persistent = false;
        self.deleted = false;
        self.session = None;
    }

    /// Claim the instance for a session.
    pub fn bind(&mut self, session: SessionId) -> Result<()> {
        match self.session {
            Some(owner) if owner != session => Err(Error::transaction(
                TransactionErrorKind::ForeignSession,
                format!("instance belongs to {owner}, not {session}"),
            )),
            _ => {
                self.session = Some(session);
                Ok(())
            }
        }
    }

    pub fn detach(&mut self) {
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_until_persistent() {
        let mut state = InstanceState::new();
        let key = state.identity_key(Some("7"));
        assert!(key.is_placeholder());
        assert_eq!(key.as_str().len(), "new:".len() + 12);
        state.mark_persistent();
        assert_eq!(state.identity_key(Some("7")).as_str(), "7");
        assert!(state.identity_key(None).is_placeholder());
    }

    #[test]
    fn deleted_requires_persistent() {
        let mut state = InstanceState::new();
        assert!(state.mark_deleted().unwrap_err().is_consistency());
        state.mark_persistent();
        state.mark_deleted().unwrap();
        assert!(state.is_deleted());
    }

    #[test]
    fn bind_rejects_foreign_session() {
        let a = SessionId::next();
        let b = SessionId::next();
        let mut state = InstanceState::new();
        state.bind(a).unwrap();
        state.bind(a).unwrap();
        let err = state.bind(b).unwrap_err();
        assert_eq!(
            err.transaction_kind(),
            Some(TransactionErrorKind::ForeignSession)
        );
        state.detach();
        state.bind(b).unwrap();
    }
}
