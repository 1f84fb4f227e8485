//! Backend query handle: a lowered plan bound to a connector.
//!
//! The plan's commands are sent once, prefixed to the first read, so the
//! first result operation costs a single round trip. Later reads reuse the
//! temporary keys until they expire.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use asupersync::{Cx, Outcome};
use kvmodel_core::{Command, Connector, Error, ModelMeta, Record, Reply, try_outcome};

use crate::lowering::{Plan, Reader};

/// Translate a half-open slice into the store's inclusive range.
///
/// `None` means the slice is empty whatever the length.
pub fn to_inclusive(start: i64, stop: Option<i64>) -> Option<(i64, i64)> {
    match stop {
        None => Some((start, -1)),
        Some(0) => None,
        Some(stop) => Some((start, stop.saturating_sub(1))),
    }
}

/// Resolve a half-open slice against a known length.
pub fn slice_range(len: usize, start: i64, stop: Option<i64>) -> Range<usize> {
    let len = len as i64;
    let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let start = clamp(start);
    let stop = stop.map_or(len, clamp);
    if start >= stop {
        0..0
    } else {
        start as usize..stop as usize
    }
}

/// Materialised result of one query.
pub struct BackendQuery<C: Connector> {
    connector: C,
    meta: Arc<ModelMeta>,
    plan: Plan,
    materialized: AtomicBool,
}

impl<C: Connector> std::fmt::Debug for BackendQuery<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendQuery")
            .field("model", &self.meta.name)
            .field("reader", &self.plan.reader)
            .field("temp_keys", &self.plan.temp_keys)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> BackendQuery<C> {
    pub fn new(connector: C, meta: Arc<ModelMeta>, plan: Plan) -> Self {
        Self {
            connector,
            meta,
            plan,
            materialized: AtomicBool::new(false),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    /// Temporary keys the plan creates.
    pub fn temp_keys(&self) -> &[String] {
        &self.plan.temp_keys
    }

    /// Whether the plan's commands have been sent.
    pub fn is_materialized(&self) -> bool {
        self.materialized.load(AtomicOrdering::Acquire)
    }

    /// Final key before any sort; `None` when nothing can match.
    pub fn result_key(&self) -> Option<&str> {
        self.plan.source.as_deref()
    }

    /// Run `reads`, preceded by the plan's commands on first use.
    async fn run(&self, cx: &Cx, reads: Vec<Command>) -> Outcome<Vec<Reply>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let prefix = if self.is_materialized() {
            0
        } else {
            self.plan.commands.len()
        };
        let mut commands = Vec::with_capacity(prefix + reads.len());
        if prefix > 0 {
            commands.extend(self.plan.commands.iter().cloned());
        }
        commands.extend(reads);
        let expected = commands.len();

        let replies = try_outcome!(self.connector.pipeline(cx, commands).await);
        if replies.len() != expected {
            return Outcome::Err(Error::protocol(format!(
                "pipeline of {expected} commands answered with {} replies",
                replies.len()
            )));
        }
        let mut replies = replies.into_iter();
        for reply in replies.by_ref().take(prefix) {
            try_outcome!(@result reply.check());
        }
        if prefix > 0 {
            self.materialized.store(true, AtomicOrdering::Release);
            tracing::trace!(
                model = self.meta.name,
                temp_keys = self.plan.temp_keys.len(),
                "Query materialized"
            );
        }
        Outcome::Ok(replies.collect())
    }

    async fn run_one(&self, cx: &Cx, read: Command) -> Outcome<Reply, Error> {
        let replies = try_outcome!(self.run(cx, vec![read]).await);
        match replies.into_iter().next() {
            Some(reply) => Outcome::Ok(reply),
            None => Outcome::Err(Error::protocol("missing reply to query read")),
        }
    }

    /// Re-send the plan, recreating expired temporary keys.
    pub async fn refresh(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.plan.commands.is_empty() {
            return Outcome::Ok(());
        }
        self.materialized.store(false, AtomicOrdering::Release);
        self.run(cx, Vec::new()).await.map(|_| ())
    }

    /// Number of matching ids.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(model = self.meta.name))]
    pub async fn count(&self, cx: &Cx) -> Outcome<u64, Error> {
        let command = match &self.plan.reader {
            Reader::Empty => return Outcome::Ok(0),
            Reader::Set(key) => Command::SCard(key.clone()),
            Reader::ZSet { key, .. } => Command::ZCard(key.clone()),
            Reader::List(key) => Command::LLen(key.clone()),
        };
        let reply = try_outcome!(self.run_one(cx, command).await);
        let n = try_outcome!(@result reply.into_int());
        Outcome::Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Whether `id` is in the result.
    pub async fn contains(&self, cx: &Cx, id: &str) -> Outcome<bool, Error> {
        let Some(source) = &self.plan.source else {
            return Outcome::Ok(false);
        };
        if self.plan.ordered {
            let reply = try_outcome!(self.run_one(cx, Command::ZScore(source.clone(), id.to_string())).await);
            reply.into_opt_float().map(|s| s.is_some()).map_or_else(Outcome::Err, Outcome::Ok)
        } else {
            let reply = try_outcome!(self.run_one(cx, Command::SIsMember(source.clone(), id.to_string())).await);
            reply.into_bool().map_or_else(Outcome::Err, Outcome::Ok)
        }
    }

    /// Ids in result order, sliced with half-open `start..stop` semantics.
    pub async fn ids(&self, cx: &Cx, start: i64, stop: Option<i64>) -> Outcome<Vec<String>, Error> {
        let command = match &self.plan.reader {
            Reader::Empty => return Outcome::Ok(Vec::new()),
            Reader::Set(key) => Command::SMembers(key.clone()),
            Reader::ZSet { key, rev } => {
                let Some((start, stop)) = to_inclusive(start, stop) else {
                    return Outcome::Ok(Vec::new());
                };
                Command::ZRange {
                    key: key.clone(),
                    start,
                    stop,
                    rev: *rev,
                }
            }
            Reader::List(key) => {
                let Some((start, stop)) = to_inclusive(start, stop) else {
                    return Outcome::Ok(Vec::new());
                };
                Command::LRange {
                    key: key.clone(),
                    start,
                    stop,
                }
            }
        };
        let client_slice = matches!(self.plan.reader, Reader::Set(_));
        let reply = try_outcome!(self.run_one(cx, command).await);
        let ids = try_outcome!(@result reply.into_list());
        if client_slice {
            let range = slice_range(ids.len(), start, stop);
            return Outcome::Ok(ids[range].to_vec());
        }
        Outcome::Ok(ids)
    }

    /// Fetch records for `ids` in one round trip.
    ///
    /// With `fields`, only those are read; the identity is always included.
    /// Ids whose record no longer exists are skipped.
    pub async fn records(
        &self,
        cx: &Cx,
        ids: &[String],
        fields: Option<&[String]>,
    ) -> Outcome<Vec<(String, Record)>, Error> {
        if ids.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let keys = &self.meta.keys;
        let identity = self.meta.identity.name;
        let projected: Option<Vec<String>> = fields.map(|fields| {
            std::iter::once(identity.to_string())
                .chain(fields.iter().filter(|f| f.as_str() != identity).cloned())
                .collect()
        });
        let commands = ids
            .iter()
            .map(|id| match &projected {
                Some(names) => Command::HMGet(keys.object(id), names.clone()),
                None => Command::HGetAll(keys.object(id)),
            })
            .collect();

        // Reads of stored records never depend on the plan's temp keys.
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let replies = try_outcome!(self.connector.pipeline(cx, commands).await);
        if replies.len() != ids.len() {
            return Outcome::Err(Error::protocol(format!(
                "record fetch of {} ids answered with {} replies",
                ids.len(),
                replies.len()
            )));
        }

        let mut out = Vec::with_capacity(ids.len());
        for (id, reply) in ids.iter().zip(replies) {
            let pairs: Vec<(String, String)> = match &projected {
                Some(names) => {
                    let values = try_outcome!(@result reply.into_optional());
                    names
                        .iter()
                        .zip(values)
                        .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
                        .collect()
                }
                None => try_outcome!(@result reply.into_pairs()),
            };
            if pairs.is_empty() {
                tracing::trace!(model = self.meta.name, id = %id, "Skipping vanished record");
                continue;
            }
            let record = try_outcome!(@result Record::from_hash(
                &self.meta,
                id,
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ));
            out.push((id.clone(), record));
        }
        Outcome::Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_to_inclusive() {
        assert_eq!(to_inclusive(0, None), Some((0, -1)));
        assert_eq!(to_inclusive(1, Some(3)), Some((1, 2)));
        assert_eq!(to_inclusive(0, Some(-1)), Some((0, -2)));
        assert_eq!(to_inclusive(2, Some(0)), None);
        assert_eq!(to_inclusive(0, Some(i64::MIN)), Some((0, i64::MIN)));
    }

    #[test]
    fn client_side_slices() {
        assert_eq!(slice_range(5, 0, None), 0..5);
        assert_eq!(slice_range(5, 1, Some(3)), 1..3);
        assert_eq!(slice_range(5, -2, None), 3..5);
        assert_eq!(slice_range(5, 0, Some(-1)), 0..4);
        assert_eq!(slice_range(5, 4, Some(2)), 0..0);
        assert_eq!(slice_range(5, -10, Some(100)), 0..5);
        assert_eq!(slice_range(0, 0, None), 0..0);
    }
}
