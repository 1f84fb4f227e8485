//! Server-side commit script.
//!
//! Runs entirely under the store lock, so a commit is observed by other
//! clients either not at all or completely.

use std::collections::{BTreeMap, BTreeSet};

use kvmodel_core::{
    BackendError, BackendErrorKind, CommitReply, DeleteSource, IndexSpec, InstanceWrite,
    ModelCommit, WriteAck, WriteReply,
};

use crate::store::{KeyKind, Store, StoreResult, WRONGTYPE};

fn failure(kind: BackendErrorKind, key: Option<String>, message: String) -> BackendError {
    BackendError { kind, key, message }
}

fn wrong_type(message: String) -> BackendError {
    failure(BackendErrorKind::WrongType, None, message)
}

/// Apply one model's deletes, then its writes.
///
/// Every instance is checked before anything of it is touched, so a
/// refused delete or write leaves its keys exactly as they were.
pub(crate) fn commit(store: &mut Store, commit: ModelCommit) -> StoreResult<CommitReply> {
    let mut reply = CommitReply::default();

    let mut seen = BTreeSet::new();
    let mut doomed = Vec::new();
    for source in &commit.deletes {
        let ids = match source {
            DeleteSource::Ids(ids) => ids.clone(),
            DeleteSource::Key(key) => store.members(key)?,
        };
        doomed.extend(ids.into_iter().filter(|id| seen.insert(id.clone())));
    }
    for id in doomed {
        let stored = match check_delete(store, &commit, &id) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::debug!(model = %commit.model, id = %id, error = %err, "Commit script refused delete");
                reply.failed_deletes.push((id, err));
                continue;
            }
        };
        if delete_one(store, &commit, &id, stored)? {
            reply.deleted.push(id);
        }
    }

    for write in &commit.writes {
        let result = check_write(store, &commit, write)
            .and_then(|checked| write_one(store, &commit, write, checked));
        if let Err(err) = &result {
            tracing::debug!(
                model = %commit.model,
                identity = %write.identity,
                error = %err,
                "Commit script rejected instance"
            );
        }
        reply.writes.push(WriteReply {
            identity: write.identity.clone(),
            result,
        });
    }
    Ok(reply)
}

fn member_kind(ordered: bool) -> KeyKind {
    if ordered { KeyKind::SortedSet } else { KeyKind::Set }
}

/// A missing key is fine; an existing one must hold `kind`.
fn expect_kind(store: &Store, key: &str, kind: KeyKind) -> Result<(), BackendError> {
    match store.kind(key) {
        Some(found) if found != kind => Err(failure(
            BackendErrorKind::WrongType,
            Some(key.to_string()),
            format!("{WRONGTYPE}: expected {kind:?}, found {found:?}"),
        )),
        _ => Ok(()),
    }
}

/// Key that holds the index or unique entry of `field`.
fn entry_key(commit: &ModelCommit, spec: &IndexSpec, value: &str) -> (String, KeyKind) {
    if spec.unique {
        (commit.keys.unique(&spec.field), KeyKind::Hash)
    } else {
        (commit.keys.index(&spec.field, value), member_kind(commit.ordered))
    }
}

fn add_member(store: &mut Store, ordered: bool, key: &str, score: f64, id: &str) -> StoreResult<()> {
    if ordered {
        store.zadd(key, &[(score, id.to_string())])?;
    } else {
        store.sadd(key, &[id.to_string()])?;
    }
    Ok(())
}

fn remove_member(store: &mut Store, ordered: bool, key: &str, id: &str) -> StoreResult<()> {
    if ordered {
        store.zrem(key, &[id.to_string()])?;
    } else {
        store.srem(key, &[id.to_string()])?;
    }
    Ok(())
}

/// Drop the index or unique entry of `value` for `id`.
fn unlink(
    store: &mut Store,
    commit: &ModelCommit,
    spec: &IndexSpec,
    value: &str,
    id: &str,
) -> StoreResult<()> {
    if spec.unique {
        let hash = commit.keys.unique(&spec.field);
        if store.hget(&hash, value)?.as_deref() == Some(id) {
            store.hdel(&hash, &[value.to_string()])?;
        }
        Ok(())
    } else {
        remove_member(store, commit.ordered, &commit.keys.index(&spec.field, value), id)
    }
}

type Stored = Option<BTreeMap<String, String>>;

/// Read the record a delete will remove and verify every key it touches.
fn check_delete(store: &Store, commit: &ModelCommit, id: &str) -> Result<Stored, BackendError> {
    let object = commit.keys.object(id);
    expect_kind(store, &commit.keys.ids(), member_kind(commit.ordered))?;
    expect_kind(store, &object, KeyKind::Hash)?;
    let stored = store.hgetall(&object).map_err(wrong_type)?;
    if let Some(stored) = &stored {
        for spec in &commit.indices {
            if let Some(value) = stored.get(&spec.field) {
                let (key, kind) = entry_key(commit, spec, value);
                expect_kind(store, &key, kind)?;
            }
        }
    }
    Ok(stored)
}

fn delete_one(store: &mut Store, commit: &ModelCommit, id: &str, stored: Stored) -> StoreResult<bool> {
    remove_member(store, commit.ordered, &commit.keys.ids(), id)?;
    let Some(stored) = stored else {
        return Ok(false);
    };
    for spec in &commit.indices {
        if let Some(value) = stored.get(&spec.field) {
            unlink(store, commit, spec, value, id)?;
        }
    }
    let mut keys = vec![commit.keys.object(id)];
    keys.extend(
        commit
            .structures
            .iter()
            .map(|name| commit.keys.structure(id, name)),
    );
    store.del(&keys);
    Ok(true)
}

/// What a write learned while checking, carried into the apply step.
struct CheckedWrite {
    stored: Stored,
    version: Option<i64>,
}

/// Everything that can refuse a write, without touching the store.
fn check_write(
    store: &Store,
    commit: &ModelCommit,
    write: &InstanceWrite,
) -> Result<CheckedWrite, BackendError> {
    if write.id.is_none() && !commit.auto_id {
        return Err(failure(
            BackendErrorKind::MissingId,
            None,
            format!("{} instance has no id and the model does not assign ids", commit.model),
        ));
    }

    expect_kind(store, &commit.keys.ids(), member_kind(commit.ordered))?;
    if write.id.is_none() {
        expect_kind(store, &commit.keys.counter(), KeyKind::String)?;
    }
    let stored = match &write.id {
        Some(id) => {
            let object = commit.keys.object(id);
            expect_kind(store, &object, KeyKind::Hash)?;
            store.hgetall(&object).map_err(wrong_type)?
        }
        None => None,
    };

    for spec in &commit.indices {
        if let Some(value) = write.index_value(&spec.field) {
            let (key, kind) = entry_key(commit, spec, value);
            expect_kind(store, &key, kind)?;
        }
        if let Some(old) = stored.as_ref().and_then(|s| s.get(&spec.field)) {
            let (key, kind) = entry_key(commit, spec, old);
            expect_kind(store, &key, kind)?;
        }
    }

    for spec in commit.indices.iter().filter(|s| s.unique) {
        let Some(value) = write.index_value(&spec.field) else {
            continue;
        };
        let hash = commit.keys.unique(&spec.field);
        let owner = store.hget(&hash, value).map_err(wrong_type)?;
        if let Some(owner) = owner {
            if Some(&owner) != write.id.as_ref() {
                return Err(failure(
                    BackendErrorKind::UniqueViolation,
                    Some(hash),
                    format!("{}={value} already belongs to id {owner}", spec.field),
                ));
            }
        }
    }

    let mut version = None;
    if let Some(field) = &commit.version_field {
        let current = match stored.as_ref().and_then(|s| s.get(field)) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                failure(
                    BackendErrorKind::Script,
                    write.id.as_ref().map(|id| commit.keys.object(id)),
                    format!("stored version {raw:?} is not an integer"),
                )
            })?,
            None => 0,
        };
        let expected = write.expected_version.unwrap_or(0);
        if current != expected {
            return Err(failure(
                BackendErrorKind::VersionConflict,
                write.id.as_ref().map(|id| commit.keys.object(id)),
                format!("expected version {expected}, stored version is {current}"),
            ));
        }
        version = Some(current + 1);
    }

    Ok(CheckedWrite { stored, version })
}

fn write_one(
    store: &mut Store,
    commit: &ModelCommit,
    write: &InstanceWrite,
    checked: CheckedWrite,
) -> Result<WriteAck, BackendError> {
    let CheckedWrite { stored, version } = checked;

    // The counter is the first mutation; a non-integer counter fails here
    // with nothing else written.
    let id = match &write.id {
        Some(id) => id.clone(),
        None => store
            .incr(&commit.keys.counter())
            .map_err(wrong_type)?
            .to_string(),
    };

    let mut fields = write.fields.clone();
    if let (Some(field), Some(next)) = (&commit.version_field, version) {
        fields.retain(|(f, _)| f != field);
        fields.push((field.clone(), next.to_string()));
    }

    if let Some(stored) = &stored {
        for spec in &commit.indices {
            if let Some(old) = stored.get(&spec.field) {
                if write.index_value(&spec.field) != Some(old.as_str()) {
                    unlink(store, commit, spec, old, &id).map_err(wrong_type)?;
                }
            }
        }
    }

    let object = commit.keys.object(&id);
    store.del(std::slice::from_ref(&object));
    fields.insert(0, (commit.identity.clone(), id.clone()));
    store.hset(&object, &fields).map_err(wrong_type)?;

    let score = write.score.unwrap_or(0.0);
    add_member(store, commit.ordered, &commit.keys.ids(), score, &id).map_err(wrong_type)?;
    for spec in &commit.indices {
        let Some(value) = write.index_value(&spec.field) else {
            continue;
        };
        if spec.unique {
            store
                .hset(&commit.keys.unique(&spec.field), &[(value.to_string(), id.clone())])
                .map_err(wrong_type)?;
        } else {
            add_member(store, commit.ordered, &commit.keys.index(&spec.field, value), score, &id)
                .map_err(wrong_type)?;
        }
    }

    Ok(WriteAck { id, version })
}
