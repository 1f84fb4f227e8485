//! Sessions, identity tracking and atomic commits for kvmodel.
//!
//! `kvmodel-session` is the **unit-of-work layer**. A [`Session`] tracks
//! instances of every model it touches, and one [`Session::commit`] sends all
//! of their writes and deletes to the store in a single atomic pipeline.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked instance per identity key and model.
//! - **Change tracking**: new, modified, loaded and deleted partitions.
//! - **Atomic commit**: one pipeline per transaction, one commit script per
//!   model, with per-instance outcomes in a [`CommitReport`].
//! - **Lifecycle handlers**: before-handlers can veto a commit; after-handler
//!   failures are collected without undoing anything.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::clone(&catalog), connector.clone());
//! session.add(hero)?;
//! session.delete(&villain)?;
//! let report = match session.commit(&cx).await {
//!     Outcome::Ok(report) => report,
//!     Outcome::Err(Error::Commit(failed)) => return Err(failed.report),
//!     other => ...,
//! };
//! ```

pub mod config;
pub mod events;
pub mod session_model;
pub mod transaction;

pub use config::SessionConfig;
pub use events::{CommitEvent, CommitEventKind, CommitHandlers, EventInstance};
pub use session_model::{Partition, SessionModel};
pub use transaction::{Transaction, TransactionStatus};

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use kvmodel_core::{
    BackendError, BackendErrorKind, Command, CommitError, CommitReply, CommitReport, Connector,
    Error, IdentityKey, Model, ModelCatalog, QueryErrorKind, Reply, Result, Script, SessionId,
    TransactionErrorKind, TransactionId, Value, try_outcome,
};
use kvmodel_query::Query;

use crate::session_model::{Applied, Prepared, SessionModelOps};

// ============================================================================
// Session
// ============================================================================

/// Unit of work over one connector.
///
/// Not shareable across tasks; each task should own its session.
pub struct Session<C: Connector> {
    id: SessionId,
    catalog: Arc<ModelCatalog>,
    connector: C,
    /// Session models in order of first use
    models: Vec<Box<dyn SessionModelOps>>,
    transaction: Option<Transaction>,
    handlers: CommitHandlers,
    config: SessionConfig,
}

impl<C: Connector> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field(
                "models",
                &self.models.iter().map(|m| m.meta().name).collect::<Vec<_>>(),
            )
            .field("transaction", &self.transaction)
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-model slot in a commit pipeline.
struct Slot {
    model: usize,
    preamble: std::ops::Range<usize>,
    commit: usize,
}

impl<C: Connector> Session<C> {
    pub fn new(catalog: Arc<ModelCatalog>, connector: C) -> Self {
        Self::with_config(catalog, connector, SessionConfig::default())
    }

    pub fn with_config(catalog: Arc<ModelCatalog>, connector: C, config: SessionConfig) -> Self {
        let id = SessionId::next();
        tracing::debug!(session = %id, "Session created");
        Self {
            id,
            catalog,
            connector,
            models: Vec::new(),
            transaction: None,
            handlers: CommitHandlers::default(),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session model of `M`, created on first use.
    pub fn model_mut<M: Model>(&mut self) -> Result<&mut SessionModel<M>> {
        let index = match self.models.iter().position(|m| m.meta().is::<M>()) {
            Some(index) => index,
            None => {
                let meta = self.catalog.meta::<M>()?;
                self.models.push(Box::new(SessionModel::<M>::new(meta)));
                self.models.len() - 1
            }
        };
        self.models[index]
            .as_any_mut()
            .downcast_mut::<SessionModel<M>>()
            .ok_or_else(|| Error::consistency(format!("session model for {} has the wrong type", M::MODEL_NAME)))
    }

    /// Session model of `M`, if the session has touched it.
    pub fn model<M: Model>(&self) -> Option<&SessionModel<M>> {
        self.models
            .iter()
            .find(|m| m.meta().is::<M>())
            .and_then(|m| m.as_any().downcast_ref::<SessionModel<M>>())
    }

    // ========================================================================
    // Lifecycle Handlers
    // ========================================================================

    /// Runs before a model's writes are validated and serialized. `Err`
    /// vetoes the commit; edits to the event's records are written.
    pub fn on_before_commit(
        &mut self,
        f: impl FnMut(&mut CommitEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.handlers.register(CommitEventKind::BeforeCommit, f);
    }

    /// Runs before a model's deletes are sent. `Err` vetoes the commit.
    pub fn on_before_delete(
        &mut self,
        f: impl FnMut(&mut CommitEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.handlers.register(CommitEventKind::BeforeDelete, f);
    }

    /// Runs once a model's writes are applied. Errors land in the report.
    pub fn on_after_commit(
        &mut self,
        f: impl FnMut(&mut CommitEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.handlers.register(CommitEventKind::AfterCommit, f);
    }

    /// Runs once a model's deletes are applied. Errors land in the report.
    pub fn on_after_delete(
        &mut self,
        f: impl FnMut(&mut CommitEvent<'_>) -> Result<()> + Send + 'static,
    ) {
        self.handlers.register(CommitEventKind::AfterDelete, f);
    }

    pub fn handlers(&self) -> &CommitHandlers {
        &self.handlers
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track an instance for writing at the next commit.
    ///
    /// Fails with `ForeignSession` if another session owns the instance.
    pub fn add<M: Model>(&mut self, mut instance: M) -> Result<IdentityKey> {
        instance.state_mut().bind(self.id)?;
        let key = self.model_mut::<M>()?.add(instance)?;
        tracing::trace!(model = M::MODEL_NAME, key = %key, "Instance added");
        Ok(key)
    }

    pub fn add_all<M: Model>(&mut self, instances: impl IntoIterator<Item = M>) -> Result<Vec<IdentityKey>> {
        instances.into_iter().map(|instance| self.add(instance)).collect()
    }

    /// Queue an instance for deletion.
    ///
    /// A persisted instance is deleted at the next commit; a never-persisted
    /// one is simply forgotten. Returns whether a backend delete was queued.
    pub fn delete<M: Model>(&mut self, instance: &M) -> Result<bool> {
        let mut instance = instance.clone();
        instance.state_mut().bind(self.id)?;
        self.model_mut::<M>()?.delete(instance)
    }

    /// Queue deletion of a stored id without loading it.
    pub fn delete_key<M: Model>(&mut self, id: impl Into<Value>) -> Result<()> {
        let id = self.encode_id::<M>(&id.into())?;
        self.model_mut::<M>()?.delete_id(id)
    }

    /// Queue deletion of every instance `query` matches at commit time.
    pub fn delete_query<M: Model>(&mut self, query: &Query<M, C>) -> Result<()> {
        if let Some(owner) = query.session().filter(|owner| *owner != self.id) {
            return Err(Error::transaction(
                TransactionErrorKind::ForeignSession,
                format!("query belongs to {owner}, not {}", self.id),
            ));
        }
        let tree = query.construct()?.clone();
        self.model_mut::<M>()?.delete_matching(tree)
    }

    /// Stop tracking an instance, discarding its pending changes.
    pub fn expunge<M: Model>(&mut self, instance: &M) -> Result<Option<M>> {
        let key = instance.identity_key();
        self.model_mut::<M>()?.expunge(&key)
    }

    /// Stop tracking everything. Any open transaction stays open.
    pub fn expunge_all(&mut self) {
        for model in &mut self.models {
            model.detach_all();
        }
        self.models.clear();
    }

    /// Tracked instance by identity key.
    pub fn instance<M: Model>(&self, key: &IdentityKey) -> Option<&M> {
        self.model::<M>()?.get(key)
    }

    /// Every tracked instance of `M`.
    pub fn instances<M: Model>(&self) -> Vec<&M> {
        self.model::<M>()
            .map(|model| model.instances().map(|(_, instance)| instance).collect())
            .unwrap_or_default()
    }

    /// Instances waiting to be written, across all models.
    pub fn dirty_count(&self) -> usize {
        self.models.iter().map(|m| m.dirty_count()).sum()
    }

    /// Deletes waiting to be sent, across all models.
    pub fn pending_delete_count(&self) -> usize {
        self.models.iter().map(|m| m.pending_delete_count()).sum()
    }

    pub fn tracked_count(&self) -> usize {
        self.models.iter().map(|m| m.tracked_count()).sum()
    }

    pub fn has_pending(&self) -> bool {
        self.dirty_count() + self.pending_delete_count() > 0
    }

    fn encode_id<M: Model>(&self, id: &Value) -> Result<String> {
        let meta = self.catalog.meta::<M>()?;
        meta.identity.field_type.encode(id).ok_or_else(|| {
            Error::query(
                QueryErrorKind::Malformed,
                meta.name,
                Some(meta.identity.name),
                "identity value cannot be null",
            )
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Query over `M` bound to this session.
    pub fn query<M: Model>(&self) -> Result<Query<M, C>> {
        Ok(Query::for_model(&self.catalog, self.connector.clone())?.with_session(self.id))
    }

    /// Instance by id, from the identity map when tracked.
    ///
    /// A tracked instance queued for deletion reads as absent.
    #[tracing::instrument(level = "debug", skip(self, cx, id), fields(model = M::MODEL_NAME))]
    pub async fn get<M: Model>(&mut self, cx: &Cx, id: impl Into<Value>) -> Outcome<Option<M>, Error> {
        let id = id.into();
        let encoded = try_outcome!(@result self.encode_id::<M>(&id));
        let key = IdentityKey::persistent(encoded.as_str());
        if let Some(model) = self.model::<M>() {
            match model.partition_of(&key) {
                Some(Partition::Deleted) => return Outcome::Ok(None),
                Some(_) => return Outcome::Ok(model.get(&key).cloned()),
                None => {}
            }
        }

        let query = try_outcome!(@result self.query::<M>());
        let Some(mut instance) = try_outcome!(query.get(cx, encoded).await) else {
            return Outcome::Ok(None);
        };
        try_outcome!(@result instance.state_mut().bind(self.id));
        let model = try_outcome!(@result self.model_mut::<M>());
        Outcome::Ok(Some(model.mark_loaded(instance)))
    }

    /// Run a query and track its results as loaded.
    ///
    /// Instances the session already tracks come back as the tracked copy.
    pub async fn fetch<M: Model>(&mut self, cx: &Cx, query: &Query<M, C>) -> Outcome<Vec<M>, Error> {
        let found = try_outcome!(query.all(cx).await);
        let id = self.id;
        let model = try_outcome!(@result self.model_mut::<M>());
        let mut out = Vec::with_capacity(found.len());
        for mut instance in found {
            try_outcome!(@result instance.state_mut().bind(id));
            out.push(model.mark_loaded(instance));
        }
        Outcome::Ok(out)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction explicitly.
    pub fn begin(&mut self) -> Result<TransactionId> {
        if let Some(open) = &self.transaction {
            return Err(Error::transaction(
                TransactionErrorKind::NestedNotSupported,
                format!("{} is already open in {}", open.id(), self.id),
            ));
        }
        let tx = Transaction::new(self.id);
        let id = tx.id();
        tracing::debug!(session = %self.id, transaction = %id, "Transaction begun");
        self.transaction = Some(tx);
        Ok(id)
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Discard every pending change and drop the open transaction.
    ///
    /// Nothing has reached the store before commit, so there is nothing to
    /// undo there.
    pub fn rollback(&mut self) {
        let dropped = self.dirty_count() + self.pending_delete_count();
        self.expunge_all();
        if let Some(mut tx) = self.transaction.take() {
            tx.finish();
            tracing::info!(
                session = %self.id,
                transaction = %tx.id(),
                dropped,
                "Transaction rolled back"
            );
        }
    }

    /// Run `f` inside a transaction and commit its changes.
    ///
    /// An `Err` from `f` rolls the session back.
    pub async fn with_transaction<T>(
        &mut self,
        cx: &Cx,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Outcome<(T, CommitReport), Error> {
        try_outcome!(@result self.begin());
        let value = match f(self) {
            Ok(value) => value,
            Err(err) => {
                self.rollback();
                return Outcome::Err(err);
            }
        };
        self.commit(cx).await.map(|report| (value, report))
    }

    /// Send every pending change in one atomic pipeline.
    ///
    /// Succeeds only when every instance committed. Otherwise returns
    /// `Error::Commit` carrying the full report, after all successful
    /// instances have been applied and every after-handler has run. Failed
    /// instances stay pending in the session.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<CommitReport, Error> {
        if self.transaction.is_none() {
            if !self.config.auto_begin {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::NotOpen,
                    format!("no transaction is open in {}", self.id),
                ));
            }
            try_outcome!(@result self.begin());
        }
        let tx_id = match &self.transaction {
            Some(tx) if tx.is_open() => tx.id(),
            Some(tx) => {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::AlreadyExecuted,
                    format!("{} already executed", tx.id()),
                ));
            }
            None => return Outcome::Err(Error::consistency("transaction vanished during commit")),
        };
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        // Handlers see records, not instances, so a veto leaves every
        // instance untouched and pending.
        let mut edits = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let (mut writes, mut deletes) = model.pending_events();
            for (kind, instances) in [
                (CommitEventKind::BeforeCommit, &mut writes),
                (CommitEventKind::BeforeDelete, &mut deletes),
            ] {
                let mut event = CommitEvent {
                    kind,
                    model: model.meta(),
                    session: self.id,
                    transaction: tx_id,
                    instances,
                };
                if let Err(err) = self.handlers.fire(&mut event) {
                    tracing::info!(
                        transaction = %tx_id,
                        model = model.meta().name,
                        event = kind.name(),
                        error = %err,
                        "Commit vetoed"
                    );
                    return Outcome::Err(err);
                }
            }
            edits.push(writes);
        }
        for (model, edited) in self.models.iter_mut().zip(edits) {
            let rebuilt = try_outcome!(@result model.absorb(edited));
            if rebuilt > 0 {
                tracing::debug!(model = model.meta().name, rebuilt, "Applied before-commit edits");
            }
        }

        let ttl = self.catalog.config().query_ttl_secs();
        let mut prepared = Vec::with_capacity(self.models.len());
        for model in &self.models {
            prepared.push(try_outcome!(@result model.prepare(self.id, self.config.validate, ttl)));
        }

        if let Some(tx) = self.transaction.as_mut() {
            try_outcome!(@result tx.start_commit());
        }

        let (commands, slots) = pipeline_for(&prepared);
        let sent = commands.len();
        let replies = if commands.is_empty() {
            Vec::new()
        } else {
            match self.connector.pipeline(cx, commands).await {
                Outcome::Ok(replies) => replies,
                other => {
                    self.finish_transaction();
                    return other.map(|_| CommitReport::new(tx_id));
                }
            }
        };
        if let Some(tx) = self.transaction.as_mut() {
            tx.finish();
        }
        if replies.len() != sent {
            self.finish_transaction();
            return Outcome::Err(Error::protocol(format!(
                "commit pipeline sent {sent} commands but got {} replies",
                replies.len()
            )));
        }

        let mut replies: Vec<Option<Reply>> = replies.into_iter().map(Some).collect();
        let mut report = CommitReport::new(tx_id);
        let mut applied: Vec<(usize, Applied)> = Vec::with_capacity(prepared.len());
        let mut slots = slots.into_iter().peekable();
        for (index, prep) in prepared.into_iter().enumerate() {
            let (reply, delete_failure) = match slots.next_if(|slot| slot.model == index) {
                Some(slot) => {
                    let delete_failure = slot
                        .preamble
                        .clone()
                        .filter_map(|i| replies[i].take())
                        .find_map(|reply| reply.check().err())
                        .map(backend_failure);
                    let reply = replies[slot.commit]
                        .take()
                        .ok_or_else(|| Error::consistency("commit reply consumed twice"))
                        .and_then(|reply| reply.into_commit())
                        .map_err(backend_failure);
                    (reply, delete_failure)
                }
                None => (Ok(CommitReply::default()), None),
            };
            let result = self.models[index].apply(prep, reply, delete_failure, &mut report);
            match result {
                Ok(done) => applied.push((index, done)),
                Err(err) => {
                    self.finish_transaction();
                    return Outcome::Err(err);
                }
            }
        }

        for (index, done) in &mut applied {
            let meta = Arc::clone(self.models[*index].meta());
            for (kind, instances) in [
                (CommitEventKind::AfterCommit, &mut done.written),
                (CommitEventKind::AfterDelete, &mut done.deleted),
            ] {
                let mut event = CommitEvent {
                    kind,
                    model: &meta,
                    session: self.id,
                    transaction: tx_id,
                    instances,
                };
                self.handlers.notify(&mut event, &mut report.notification_errors);
            }
        }

        self.finish_transaction();
        tracing::info!(
            transaction = %tx_id,
            committed = report.committed().count(),
            failed = report.failure_count(),
            notification_errors = report.notification_errors.len(),
            "Transaction committed"
        );
        if report.is_success() {
            Outcome::Ok(report)
        } else {
            Outcome::Err(Error::Commit(CommitError {
                report: Box::new(report),
            }))
        }
    }

    fn finish_transaction(&mut self) {
        if let Some(mut tx) = self.transaction.take() {
            tx.finish();
        }
    }
}

/// Lay out one pipeline: per model with work, its delete preamble followed
/// by its commit script.
fn pipeline_for(prepared: &[Prepared]) -> (Vec<Command>, Vec<Slot>) {
    let mut commands = Vec::new();
    let mut slots = Vec::new();
    for (model, prep) in prepared.iter().enumerate() {
        if !prep.has_batch() {
            continue;
        }
        let start = commands.len();
        commands.extend(prep.preamble.iter().cloned());
        let preamble = start..commands.len();
        commands.push(Command::Eval(Script::Commit(prep.commit.clone())));
        slots.push(Slot {
            model,
            preamble,
            commit: commands.len() - 1,
        });
    }
    (commands, slots)
}

fn backend_failure(err: Error) -> BackendError {
    match err {
        Error::Backend(failure) => failure,
        other => BackendError {
            kind: BackendErrorKind::Protocol,
            key: None,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failure_keeps_backend_errors() {
        let failure = backend_failure(Error::Backend(BackendError {
            kind: BackendErrorKind::UniqueViolation,
            key: Some("k".into()),
            message: "taken".into(),
        }));
        assert_eq!(failure.kind, BackendErrorKind::UniqueViolation);

        let failure = backend_failure(Error::protocol("odd reply"));
        assert_eq!(failure.kind, BackendErrorKind::Protocol);
        assert!(failure.message.contains("odd reply"));
    }
}
