//! Transaction lifecycle.

use std::fmt;

use kvmodel_core::{Error, Result, SessionId, TransactionErrorKind, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting changes; commit not attempted yet
    Open,
    /// The commit batch has been sent
    Executed,
    /// Outcome processed or rolled back
    Finished,
}

/// The unit of work batching a session's pending changes into one
/// backend round trip. Commits at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
    session: SessionId,
    status: TransactionStatus,
}

impl Transaction {
    pub(crate) fn new(session: SessionId) -> Self {
        Self {
            id: TransactionId::next(),
            session,
            status: TransactionStatus::Open,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == TransactionStatus::Open
    }

    /// Move to `Executed`. Fails unless open.
    pub(crate) fn start_commit(&mut self) -> Result<()> {
        if self.status != TransactionStatus::Open {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyExecuted,
                format!("{} already executed", self.id),
            ));
        }
        self.status = TransactionStatus::Executed;
        Ok(())
    }

    pub(crate) fn finish(&mut self) {
        self.status = TransactionStatus::Finished;
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {:?})", self.id, self.session, self.status)
    }
}
