//! Commit lifecycle callbacks.
//!
//! Handlers are registered per event kind on a session and run
//! synchronously by the commit, once per model with affected instances:
//! before-handlers ahead of validation and serialization (an `Err` vetoes
//! the commit), after-handlers once ids and states are fixed up.
//!
//! Record edits made by a before-commit handler are folded back into the
//! pending instances and written. Edits in other events are discarded.
//! Deletes matched by a delete query surface only in after-delete events,
//! since their ids resolve inside the commit pipeline.

use kvmodel_core::{Error, IdentityKey, ModelMeta, Record, SessionId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEventKind {
    BeforeCommit,
    BeforeDelete,
    AfterCommit,
    AfterDelete,
}

impl CommitEventKind {
    pub fn name(self) -> &'static str {
        match self {
            CommitEventKind::BeforeCommit => "before_commit",
            CommitEventKind::BeforeDelete => "before_delete",
            CommitEventKind::AfterCommit => "after_commit",
            CommitEventKind::AfterDelete => "after_delete",
        }
    }

    pub fn is_before(self) -> bool {
        matches!(self, CommitEventKind::BeforeCommit | CommitEventKind::BeforeDelete)
    }
}

/// One affected instance as handlers see it.
#[derive(Debug, Clone)]
pub struct EventInstance {
    pub key: IdentityKey,
    /// Backend id; `None` for instances not written yet
    pub id: Option<String>,
    /// Field values; empty for deletes by id of untracked instances
    pub record: Record,
}

/// Payload passed to handlers.
#[derive(Debug)]
pub struct CommitEvent<'a> {
    pub kind: CommitEventKind,
    pub model: &'a ModelMeta,
    pub session: SessionId,
    pub transaction: TransactionId,
    pub instances: &'a mut [EventInstance],
}

type CommitHandler = Box<dyn FnMut(&mut CommitEvent<'_>) -> Result<(), Error> + Send>;

/// Registered handlers, in registration order per kind.
#[derive(Default)]
pub struct CommitHandlers {
    before_commit: Vec<CommitHandler>,
    before_delete: Vec<CommitHandler>,
    after_commit: Vec<CommitHandler>,
    after_delete: Vec<CommitHandler>,
}

impl std::fmt::Debug for CommitHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHandlers")
            .field("before_commit", &self.before_commit.len())
            .field("before_delete", &self.before_delete.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_delete", &self.after_delete.len())
            .finish()
    }
}

impl CommitHandlers {
    pub(crate) fn register(
        &mut self,
        kind: CommitEventKind,
        handler: impl FnMut(&mut CommitEvent<'_>) -> Result<(), Error> + Send + 'static,
    ) {
        self.handlers_mut(kind).push(Box::new(handler));
    }

    fn handlers_mut(&mut self, kind: CommitEventKind) -> &mut Vec<CommitHandler> {
        match kind {
            CommitEventKind::BeforeCommit => &mut self.before_commit,
            CommitEventKind::BeforeDelete => &mut self.before_delete,
            CommitEventKind::AfterCommit => &mut self.after_commit,
            CommitEventKind::AfterDelete => &mut self.after_delete,
        }
    }

    pub fn len(&self, kind: CommitEventKind) -> usize {
        match kind {
            CommitEventKind::BeforeCommit => self.before_commit.len(),
            CommitEventKind::BeforeDelete => self.before_delete.len(),
            CommitEventKind::AfterCommit => self.after_commit.len(),
            CommitEventKind::AfterDelete => self.after_delete.len(),
        }
    }

    /// Run handlers until the first error, which is returned.
    pub(crate) fn fire(&mut self, event: &mut CommitEvent<'_>) -> Result<(), Error> {
        if event.instances.is_empty() {
            return Ok(());
        }
        for handler in self.handlers_mut(event.kind).iter_mut() {
            handler(&mut *event)?;
        }
        Ok(())
    }

    /// Run every handler, collecting errors instead of stopping.
    pub(crate) fn notify(&mut self, event: &mut CommitEvent<'_>, errors: &mut Vec<Error>) {
        if event.instances.is_empty() {
            return;
        }
        for handler in self.handlers_mut(event.kind).iter_mut() {
            if let Err(err) = handler(&mut *event) {
                tracing::warn!(
                    event = event.kind.name(),
                    model = event.model.name,
                    transaction = %event.transaction,
                    error = %err,
                    "Commit handler failed"
                );
                errors.push(err);
            }
        }
    }
}
