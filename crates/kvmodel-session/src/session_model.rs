//! Per-model identity map.
//!
//! A [`SessionModel`] holds every instance of one model a session knows
//! about, keyed by identity key and partitioned into `new`, `modified`,
//! `loaded` and `deleted`. A key lives in at most one partition; finding it
//! in two is an internal consistency failure, reported rather than
//! tolerated.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kvmodel_core::validate::validate_instance;
use kvmodel_core::{
    BackendError, Command, CommitAction, CommitReply, CommitReport, DeleteSource, Error, IdentityKey,
    InstanceOutcome, InstanceWrite, Model, ModelCommit, ModelMeta, Record, Result, SessionId,
    ValidationError, Value,
};
use kvmodel_query::{Combinator, lower};

use crate::events::EventInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Added, never persisted
    New,
    /// Persisted and added again
    Modified,
    /// Read from the store, unchanged
    Loaded,
    /// Persisted and queued for deletion
    Deleted,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::New,
        Partition::Modified,
        Partition::Loaded,
        Partition::Deleted,
    ];
}

/// One model's contribution to a commit, computed without side effects.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub commit: ModelCommit,
    /// Commands computing the delete key; run ahead of the commit script
    pub preamble: Vec<Command>,
    pub invalid: Vec<(IdentityKey, Option<String>, ValidationError)>,
    pub deletes: Vec<EventInstance>,
}

impl Prepared {
    pub fn has_batch(&self) -> bool {
        !self.commit.is_empty()
    }
}

/// Instances whose commit succeeded, for after-handlers.
#[derive(Debug, Default)]
pub(crate) struct Applied {
    pub written: Vec<EventInstance>,
    pub deleted: Vec<EventInstance>,
}

/// Identity map of one model inside a session.
pub struct SessionModel<M: Model> {
    meta: Arc<ModelMeta>,
    new: BTreeMap<IdentityKey, M>,
    modified: BTreeMap<IdentityKey, M>,
    loaded: BTreeMap<IdentityKey, M>,
    deleted: BTreeMap<IdentityKey, M>,
    delete_ids: Vec<String>,
    delete_queries: Vec<Combinator>,
}

impl<M: Model> std::fmt::Debug for SessionModel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionModel")
            .field("model", &self.meta.name)
            .field("new", &self.new.len())
            .field("modified", &self.modified.len())
            .field("loaded", &self.loaded.len())
            .field("deleted", &self.deleted.len())
            .field("delete_ids", &self.delete_ids)
            .field("delete_queries", &self.delete_queries.len())
            .finish()
    }
}

impl<M: Model> SessionModel<M> {
    pub fn new(meta: Arc<ModelMeta>) -> Self {
        Self {
            meta,
            new: BTreeMap::new(),
            modified: BTreeMap::new(),
            loaded: BTreeMap::new(),
            deleted: BTreeMap::new(),
            delete_ids: Vec::new(),
            delete_queries: Vec::new(),
        }
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    fn map(&self, partition: Partition) -> &BTreeMap<IdentityKey, M> {
        match partition {
            Partition::New => &self.new,
            Partition::Modified => &self.modified,
            Partition::Loaded => &self.loaded,
            Partition::Deleted => &self.deleted,
        }
    }

    fn map_mut(&mut self, partition: Partition) -> &mut BTreeMap<IdentityKey, M> {
        match partition {
            Partition::New => &mut self.new,
            Partition::Modified => &mut self.modified,
            Partition::Loaded => &mut self.loaded,
            Partition::Deleted => &mut self.deleted,
        }
    }

    /// Partition currently holding `key`.
    pub fn partition_of(&self, key: &IdentityKey) -> Option<Partition> {
        Partition::ALL
            .into_iter()
            .find(|p| self.map(*p).contains_key(key))
    }

    /// Remove `key` from whichever partition holds it.
    pub fn pop(&mut self, key: &IdentityKey) -> Result<Option<(Partition, M)>> {
        let mut found = None;
        for partition in Partition::ALL {
            if let Some(instance) = self.map_mut(partition).remove(key) {
                if let Some((first, _)) = &found {
                    return Err(Error::consistency(format!(
                        "{} instance {key} held by both {first:?} and {partition:?}",
                        self.meta.name
                    )));
                }
                found = Some((partition, instance));
            }
        }
        Ok(found)
    }

    /// Track an instance as new or modified.
    pub fn add(&mut self, mut instance: M) -> Result<IdentityKey> {
        let key = instance.identity_key();
        self.pop(&key)?;
        instance.state_mut().clear_deleted();
        let partition = if instance.state().is_persistent() {
            Partition::Modified
        } else {
            Partition::New
        };
        self.map_mut(partition).insert(key.clone(), instance);
        Ok(key)
    }

    /// Queue a persisted instance for deletion; forget a new one.
    ///
    /// Returns whether a backend delete was queued.
    pub fn delete(&mut self, instance: M) -> Result<bool> {
        let key = instance.identity_key();
        let mut instance = match self.pop(&key)? {
            Some((_, held)) => held,
            None => instance,
        };
        if instance.state().is_persistent() {
            instance.state_mut().mark_deleted()?;
            self.deleted.insert(key, instance);
            Ok(true)
        } else {
            instance.state_mut().detach();
            Ok(false)
        }
    }

    /// Queue deletion of a stored id, tracked or not.
    pub fn delete_id(&mut self, id: String) -> Result<()> {
        let key = IdentityKey::persistent(id.as_str());
        if let Some((partition, mut instance)) = self.pop(&key)? {
            if instance.state().is_persistent() {
                instance.state_mut().mark_deleted()?;
                self.deleted.insert(key, instance);
                return Ok(());
            }
            self.map_mut(partition).insert(key, instance);
        }
        if !self.delete_ids.contains(&id) {
            self.delete_ids.push(id);
        }
        Ok(())
    }

    /// Queue deletion of everything a query tree matches.
    pub fn delete_matching(&mut self, tree: Combinator) -> Result<()> {
        if tree.meta().keys != self.meta.keys {
            return Err(Error::consistency(format!(
                "delete query over {} queued on {}",
                tree.meta().keys.base(),
                self.meta.keys.base()
            )));
        }
        if !tree.is_empty() {
            self.delete_queries.push(tree);
        }
        Ok(())
    }

    /// Stop tracking `key`; the instance is returned detached.
    pub fn expunge(&mut self, key: &IdentityKey) -> Result<Option<M>> {
        Ok(self.pop(key)?.map(|(_, mut instance)| {
            instance.state_mut().detach();
            instance
        }))
    }

    /// Record an instance read from the store.
    ///
    /// When the session already tracks its identity, the tracked copy wins
    /// and a clone of it is returned.
    pub fn mark_loaded(&mut self, instance: M) -> M {
        let key = instance.identity_key();
        if let Some(partition) = self.partition_of(&key) {
            if let Some(held) = self.map(partition).get(&key) {
                return held.clone();
            }
        }
        self.loaded.insert(key, instance.clone());
        instance
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&M> {
        Partition::ALL
            .into_iter()
            .find_map(|p| self.map(p).get(key))
    }

    /// Every tracked instance, partition by partition.
    pub fn instances(&self) -> impl Iterator<Item = (&IdentityKey, &M)> {
        self.new
            .iter()
            .chain(self.modified.iter())
            .chain(self.loaded.iter())
            .chain(self.deleted.iter())
    }

    /// New and modified instances.
    pub fn dirty(&self) -> impl Iterator<Item = (&IdentityKey, &M)> {
        self.new.iter().chain(self.modified.iter())
    }

    pub fn len(&self) -> usize {
        Partition::ALL.into_iter().map(|p| self.map(p).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition_len(&self, partition: Partition) -> usize {
        self.map(partition).len()
    }

    fn dirty_len(&self) -> usize {
        self.new.len() + self.modified.len()
    }

    fn pending_delete_len(&self) -> usize {
        self.deleted.len() + self.delete_ids.len() + self.delete_queries.len()
    }

    fn outcome(
        &self,
        key: IdentityKey,
        id: Option<String>,
        action: CommitAction,
        error: Option<Error>,
    ) -> InstanceOutcome {
        InstanceOutcome {
            model: self.meta.name.to_string(),
            key,
            id,
            action,
            error,
        }
    }

    fn prepare_model(&self, session: SessionId, validate: bool, ttl_secs: u64) -> Result<Prepared> {
        let meta = &self.meta;
        let mut commit = ModelCommit::new(meta);
        let mut invalid = Vec::new();

        for (key, instance) in self.dirty() {
            let record = instance.to_record();
            if validate {
                if let Err(errors) = validate_instance(instance, &record) {
                    invalid.push((key.clone(), instance.primary_key(), errors));
                    continue;
                }
            }
            let expected = meta.version_field.map(|_| instance.version().unwrap_or(0));
            commit
                .writes
                .push(InstanceWrite::from_record(meta, key.clone(), &record, expected));
        }

        let deletes = self.delete_events();
        let ids: Vec<Value> = deletes
            .iter()
            .filter_map(|d| d.id.clone().map(Value::Text))
            .collect();

        let mut trees = vec![Combinator::selection(
            Arc::clone(meta),
            Some(session),
            meta.identity.name,
            ids,
        )];
        trees.extend(self.delete_queries.iter().cloned());
        let tree = Combinator::union(Arc::clone(meta), Some(session), trees);
        let mut preamble = Vec::new();
        if !tree.is_empty() {
            let plan = lower(&tree, None, ttl_secs)?;
            preamble = plan.commands;
            if let Some(source) = plan.source {
                commit.deletes.push(DeleteSource::Key(source));
            }
        }

        Ok(Prepared {
            commit,
            preamble,
            invalid,
            deletes,
        })
    }

    /// Pending writes as before-handlers see them.
    fn write_events(&self) -> Vec<EventInstance> {
        self.dirty()
            .map(|(key, instance)| EventInstance {
                key: key.clone(),
                id: instance.primary_key(),
                record: instance.to_record(),
            })
            .collect()
    }

    /// Tracked deletes first, then deletes by bare id.
    fn delete_events(&self) -> Vec<EventInstance> {
        let tracked = self.deleted.iter().map(|(key, instance)| EventInstance {
            key: key.clone(),
            id: instance.primary_key(),
            record: instance.to_record(),
        });
        let bare = self.delete_ids.iter().map(|id| EventInstance {
            key: IdentityKey::persistent(id.as_str()),
            id: Some(id.clone()),
            record: Record::new(),
        });
        tracked.chain(bare).collect()
    }

    /// Rebuild every pending instance whose record a before-handler edited.
    ///
    /// The rebuilt instance keeps the original's state. Changing the id is
    /// refused, since the identity key would no longer match.
    fn absorb_edits(&mut self, edited: Vec<EventInstance>) -> Result<usize> {
        let mut rebuilt = 0;
        for event in edited {
            let partition = match self.partition_of(&event.key) {
                Some(p @ (Partition::New | Partition::Modified)) => p,
                _ => continue,
            };
            let name = self.meta.name;
            let Some(instance) = self.map_mut(partition).get_mut(&event.key) else {
                continue;
            };
            if instance.to_record() == event.record {
                continue;
            }
            let id = instance.primary_key();
            let mut fresh = M::from_record(id.as_deref().unwrap_or_default(), &event.record)?;
            if fresh.primary_key() != id {
                return Err(Error::consistency(format!(
                    "a before-commit handler changed the id of {name} instance {}",
                    event.key
                )));
            }
            *fresh.state_mut() = std::mem::take(instance.state_mut());
            *instance = fresh;
            rebuilt += 1;
        }
        Ok(rebuilt)
    }

    fn apply_reply(
        &mut self,
        prepared: Prepared,
        reply: std::result::Result<CommitReply, BackendError>,
        delete_failure: Option<BackendError>,
        report: &mut CommitReport,
    ) -> Result<Applied> {
        let mut applied = Applied::default();

        for (key, id, errors) in prepared.invalid {
            report
                .outcomes
                .push(self.outcome(key, id, CommitAction::Write, Some(Error::Validation(errors))));
        }

        let reply = match reply {
            Ok(reply) => reply,
            Err(failure) => {
                for write in &prepared.commit.writes {
                    report.outcomes.push(self.outcome(
                        write.identity.clone(),
                        write.id.clone(),
                        CommitAction::Write,
                        Some(Error::Backend(failure.clone())),
                    ));
                }
                for delete in prepared.deletes {
                    report.outcomes.push(self.outcome(
                        delete.key,
                        delete.id,
                        CommitAction::Delete,
                        Some(Error::Backend(failure.clone())),
                    ));
                }
                return Ok(applied);
            }
        };

        if reply.writes.len() != prepared.commit.writes.len() {
            return Err(Error::consistency(format!(
                "{} commit sent {} writes but got {} replies",
                self.meta.name,
                prepared.commit.writes.len(),
                reply.writes.len()
            )));
        }

        for write in reply.writes {
            let Some((partition, mut instance)) = self.pop(&write.identity)? else {
                return Err(Error::consistency(format!(
                    "commit reply names {} instance {} which the session does not hold",
                    self.meta.name, write.identity
                )));
            };
            let ack = match write.result {
                Ok(ack) => ack,
                Err(err) => {
                    let id = instance.primary_key();
                    self.map_mut(partition).insert(write.identity.clone(), instance);
                    report.outcomes.push(self.outcome(
                        write.identity,
                        id,
                        CommitAction::Write,
                        Some(Error::Backend(err)),
                    ));
                    continue;
                }
            };
            if let Err(err) = instance.set_primary_key(&ack.id) {
                self.map_mut(partition).insert(write.identity.clone(), instance);
                report.outcomes.push(self.outcome(
                    write.identity,
                    Some(ack.id),
                    CommitAction::Write,
                    Some(err),
                ));
                continue;
            }
            if let Some(version) = ack.version {
                instance.set_version(version);
            }
            instance.state_mut().mark_persistent();
            let key = IdentityKey::persistent(ack.id.as_str());
            self.pop(&key)?;
            applied.written.push(EventInstance {
                key: key.clone(),
                id: Some(ack.id.clone()),
                record: instance.to_record(),
            });
            self.loaded.insert(key, instance);
            report
                .outcomes
                .push(self.outcome(write.identity, Some(ack.id), CommitAction::Write, None));
        }

        if let Some(failure) = delete_failure {
            for delete in prepared.deletes {
                report.outcomes.push(self.outcome(
                    delete.key,
                    delete.id,
                    CommitAction::Delete,
                    Some(Error::Backend(failure.clone())),
                ));
            }
            return Ok(applied);
        }

        let mut removed: BTreeSet<String> = reply.deleted.into_iter().collect();
        let mut refused: BTreeMap<String, BackendError> = reply.failed_deletes.into_iter().collect();
        let mut retry = Vec::new();
        for delete in prepared.deletes {
            if let Some(err) = delete.id.as_ref().and_then(|id| refused.remove(id)) {
                // A tracked instance stays in the deleted partition; a bare id is queued again.
                if !self.deleted.contains_key(&delete.key) {
                    retry.extend(delete.id.clone());
                }
                report.outcomes.push(self.outcome(
                    delete.key,
                    delete.id,
                    CommitAction::Delete,
                    Some(Error::Backend(err)),
                ));
                continue;
            }
            if let Some((_, mut instance)) = self.pop(&delete.key)? {
                instance.state_mut().mark_removed();
            }
            if let Some(id) = &delete.id {
                removed.remove(id);
            }
            report.outcomes.push(self.outcome(
                delete.key.clone(),
                delete.id.clone(),
                CommitAction::Delete,
                None,
            ));
            applied.deleted.push(delete);
        }
        // Ids matched only by delete queries.
        for id in removed {
            let key = IdentityKey::persistent(id.as_str());
            let record = match self.pop(&key)? {
                Some((_, mut instance)) => {
                    instance.state_mut().mark_removed();
                    instance.to_record()
                }
                None => Record::new(),
            };
            report
                .outcomes
                .push(self.outcome(key.clone(), Some(id.clone()), CommitAction::Delete, None));
            applied.deleted.push(EventInstance {
                key,
                id: Some(id),
                record,
            });
        }
        // Ids matched only by delete queries and refused by the store.
        for (id, err) in refused {
            report.outcomes.push(self.outcome(
                IdentityKey::persistent(id.as_str()),
                Some(id.clone()),
                CommitAction::Delete,
                Some(Error::Backend(err)),
            ));
            retry.push(id);
        }
        self.delete_ids.clear();
        self.delete_queries.clear();
        self.delete_ids.extend(retry);
        Ok(applied)
    }

    fn detach_all_instances(&mut self) {
        for partition in Partition::ALL {
            for (_, mut instance) in std::mem::take(self.map_mut(partition)) {
                instance.state_mut().detach();
            }
        }
        self.delete_ids.clear();
        self.delete_queries.clear();
    }
}

/// Type-erased view of a [`SessionModel`], for the session's ordered list.
pub(crate) trait SessionModelOps: Send + Sync {
    fn meta(&self) -> &Arc<ModelMeta>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn dirty_count(&self) -> usize;
    fn pending_delete_count(&self) -> usize;
    fn tracked_count(&self) -> usize;
    /// Records of pending writes and deletes, for before-handlers.
    fn pending_events(&self) -> (Vec<EventInstance>, Vec<EventInstance>);
    /// Fold before-handler edits back into the pending instances.
    fn absorb(&mut self, edited: Vec<EventInstance>) -> Result<usize>;
    /// Pre-commit: validate, serialize and lower deletes.
    fn prepare(&self, session: SessionId, validate: bool, ttl_secs: u64) -> Result<Prepared>;
    /// Post-commit: fix up identities and states, record outcomes.
    fn apply(
        &mut self,
        prepared: Prepared,
        reply: std::result::Result<CommitReply, BackendError>,
        delete_failure: Option<BackendError>,
        report: &mut CommitReport,
    ) -> Result<Applied>;
    fn detach_all(&mut self);
}

impl<M: Model> SessionModelOps for SessionModel<M> {
    fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn dirty_count(&self) -> usize {
        self.dirty_len()
    }

    fn pending_delete_count(&self) -> usize {
        self.pending_delete_len()
    }

    fn tracked_count(&self) -> usize {
        self.len()
    }

    fn pending_events(&self) -> (Vec<EventInstance>, Vec<EventInstance>) {
        (self.write_events(), self.delete_events())
    }

    fn absorb(&mut self, edited: Vec<EventInstance>) -> Result<usize> {
        self.absorb_edits(edited)
    }

    fn prepare(&self, session: SessionId, validate: bool, ttl_secs: u64) -> Result<Prepared> {
        self.prepare_model(session, validate, ttl_secs)
    }

    fn apply(
        &mut self,
        prepared: Prepared,
        reply: std::result::Result<CommitReply, BackendError>,
        delete_failure: Option<BackendError>,
        report: &mut CommitReport,
    ) -> Result<Applied> {
        self.apply_reply(prepared, reply, delete_failure, report)
    }

    fn detach_all(&mut self) {
        self.detach_all_instances();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvmodel_core::{FieldInfo, FieldType, InstanceState, ModelCatalog, WriteAck, WriteReply};

    #[derive(Debug, Clone, Default)]
    struct Note {
        id: Option<i64>,
        text: String,
        state: InstanceState,
    }

    impl Model for Note {
        const MODEL_NAME: &'static str = "note";

        fn fields() -> &'static [FieldInfo] {
            static FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", FieldType::Int).primary_key(true).auto(true),
                FieldInfo::new("text", FieldType::Text).max_length(8),
            ];
            FIELDS
        }
        fn primary_key(&self) -> Option<String> {
            self.id.map(|id| id.to_string())
        }
        fn set_primary_key(&mut self, id: &str) -> Result<()> {
            self.id = Some(id.parse().map_err(|_| Error::Custom(format!("bad id {id}")))?);
            Ok(())
        }
        fn to_record(&self) -> Record {
            Record::new().with("id", self.id).with("text", self.text.as_str())
        }
        fn from_record(_id: &str, record: &Record) -> Result<Self> {
            Ok(Self {
                id: record.field("id")?,
                text: record.field("text")?,
                state: InstanceState::loaded(),
            })
        }
        fn state(&self) -> &InstanceState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut InstanceState {
            &mut self.state
        }
    }

    fn model() -> SessionModel<Note> {
        let catalog = ModelCatalog::default();
        SessionModel::new(catalog.register::<Note>().expect("register note"))
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
            ..Note::default()
        }
    }

    fn stored(id: i64, text: &str) -> Note {
        Note {
            id: Some(id),
            text: text.to_string(),
            state: InstanceState::loaded(),
        }
    }

    #[test]
    fn add_routes_by_persistence() {
        let mut m = model();
        let fresh = m.add(note("a")).unwrap();
        assert_eq!(m.partition_of(&fresh), Some(Partition::New));
        let old = m.add(stored(4, "b")).unwrap();
        assert_eq!(old, IdentityKey::persistent("4"));
        assert_eq!(m.partition_of(&old), Some(Partition::Modified));
        // Adding again replaces in place.
        m.add(stored(4, "c")).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(&old).unwrap().text, "c");
    }

    #[test]
    fn delete_new_forgets_and_delete_stored_queues() {
        let mut m = model();
        let n = note("a");
        let key = m.add(n.clone()).unwrap();
        assert!(!m.delete(n).unwrap());
        assert_eq!(m.partition_of(&key), None);

        assert!(m.delete(stored(5, "x")).unwrap());
        let key = IdentityKey::persistent("5");
        assert_eq!(m.partition_of(&key), Some(Partition::Deleted));
        assert!(m.get(&key).unwrap().state().is_deleted());
        assert_eq!(m.pending_delete_len(), 1);

        m.add(stored(5, "x")).unwrap();
        assert_eq!(m.partition_of(&key), Some(Partition::Modified));
        assert!(!m.get(&key).unwrap().state().is_deleted());
    }

    #[test]
    fn duplicate_partition_membership_is_a_consistency_error() {
        let mut m = model();
        let key = IdentityKey::persistent("9");
        m.loaded.insert(key.clone(), stored(9, "a"));
        m.modified.insert(key.clone(), stored(9, "b"));
        assert!(m.pop(&key).unwrap_err().is_consistency());
    }

    #[test]
    fn loaded_instances_defer_to_tracked_copies() {
        let mut m = model();
        m.add(stored(2, "edited")).unwrap();
        let got = m.mark_loaded(stored(2, "stale"));
        assert_eq!(got.text, "edited");
        let got = m.mark_loaded(stored(3, "fresh"));
        assert_eq!(got.text, "fresh");
        assert_eq!(m.partition_len(Partition::Loaded), 1);
    }

    #[test]
    fn prepare_validates_and_lowers_deletes() {
        let mut m = model();
        m.add(note("short")).unwrap();
        m.add(note("far too long")).unwrap();
        m.delete(stored(7, "x")).unwrap();
        m.delete_id("8".to_string()).unwrap();

        let prepared = m.prepare_model(SessionId::next(), true, 30).unwrap();
        assert_eq!(prepared.commit.writes.len(), 1);
        assert_eq!(prepared.invalid.len(), 1);
        assert_eq!(prepared.deletes.len(), 2);
        assert!(matches!(prepared.commit.deletes[..], [DeleteSource::Key(_)]));
        assert!(prepared.preamble.iter().any(|c| matches!(c, Command::Expire(_, 30))));
        // Preparing has no side effects.
        assert_eq!(m.dirty_len(), 2);
    }

    #[test]
    fn absorbed_edits_rebuild_instances_and_keep_their_state() {
        let mut m = model();
        let fresh = m.add(note("draft")).unwrap();
        let old = m.add(stored(3, "old")).unwrap();
        m.add(note("same")).unwrap();
        let mut writes = m.write_events();
        for event in &mut writes {
            if event.key == fresh {
                event.record.set("text", "edited");
            } else if event.key == old {
                event.record.set("text", "renamed");
            }
        }
        assert_eq!(m.absorb_edits(writes).unwrap(), 2);

        let edited = m.get(&fresh).unwrap();
        assert_eq!(edited.text, "edited");
        assert!(!edited.state().is_persistent());
        assert_eq!(edited.identity_key(), fresh);
        assert_eq!(m.get(&old).unwrap().text, "renamed");
        assert!(m.get(&old).unwrap().state().is_persistent());
        assert_eq!(m.dirty_len(), 3);
    }

    #[test]
    fn absorbed_edit_may_not_change_the_id() {
        let mut m = model();
        let fresh = m.add(note("draft")).unwrap();
        let mut writes = m.write_events();
        writes[0].record.set("id", 99_i64);
        assert!(m.absorb_edits(writes).unwrap_err().is_consistency());
        assert_eq!(m.get(&fresh).unwrap().id, None);
    }

    #[test]
    fn apply_fixes_identities_and_keeps_failures_dirty() {
        let mut m = model();
        let a = m.add(note("a")).unwrap();
        let b = m.add(note("b")).unwrap();
        let prepared = m.prepare_model(SessionId::next(), true, 30).unwrap();
        let reply = CommitReply {
            writes: prepared
                .commit
                .writes
                .iter()
                .map(|w| WriteReply {
                    identity: w.identity.clone(),
                    result: if w.identity == a {
                        Ok(WriteAck {
                            id: "1".into(),
                            version: None,
                        })
                    } else {
                        Err(BackendError {
                            kind: kvmodel_core::BackendErrorKind::UniqueViolation,
                            key: None,
                            message: "taken".into(),
                        })
                    },
                })
                .collect(),
            ..CommitReply::default()
        };
        let mut report = CommitReport::new(kvmodel_core::TransactionId::next());
        let applied = m.apply_reply(prepared, Ok(reply), None, &mut report).unwrap();
        assert_eq!(applied.written.len(), 1);
        assert_eq!(report.failure_count(), 1);

        let one = IdentityKey::persistent("1");
        assert_eq!(m.partition_of(&one), Some(Partition::Loaded));
        assert_eq!(m.get(&one).unwrap().id, Some(1));
        assert!(m.get(&one).unwrap().state().is_persistent());
        assert_eq!(m.partition_of(&a), None);
        assert_eq!(m.partition_of(&b), Some(Partition::New));
    }

    #[test]
    fn unknown_reply_identity_is_a_consistency_error() {
        let mut m = model();
        m.add(note("a")).unwrap();
        let prepared = m.prepare_model(SessionId::next(), true, 30).unwrap();
        let reply = CommitReply {
            writes: vec![WriteReply {
                identity: IdentityKey::from("new:ghost"),
                result: Ok(WriteAck {
                    id: "1".into(),
                    version: None,
                }),
            }],
            ..CommitReply::default()
        };
        let mut report = CommitReport::new(kvmodel_core::TransactionId::next());
        let err = m.apply_reply(prepared, Ok(reply), None, &mut report).unwrap_err();
        assert!(err.is_consistency());
    }
}
