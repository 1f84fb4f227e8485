//! Key space and command semantics of the in-process store.
//!
//! Commands follow Redis semantics for the subset the mapper uses:
//! collections disappear when they become empty, store operations replace
//! their destination, missing keys read as empty, and a command against a
//! key of another kind fails with `WRONGTYPE` without affecting the rest of
//! the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use kvmodel_core::{Aggregate, Command, Reply, Script};

use crate::script;

pub(crate) const WRONGTYPE: &str =
    "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_INTEGER: &str = "ERR value is not an integer or out of range";
const NOT_DOUBLE: &str = "ERR One or more scores can't be converted into double";

pub(crate) type StoreResult<T> = std::result::Result<T, String>;

/// Kind of value held by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    String,
    Set,
    SortedSet,
    List,
    Hash,
}

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, f64>),
    List(Vec<String>),
    Hash(BTreeMap<String, String>),
}

impl Data {
    fn kind(&self) -> KeyKind {
        match self {
            Data::Str(_) => KeyKind::String,
            Data::Set(_) => KeyKind::Set,
            Data::ZSet(_) => KeyKind::SortedSet,
            Data::List(_) => KeyKind::List,
            Data::Hash(_) => KeyKind::Hash,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Data::Str(_) => false,
            Data::Set(s) => s.is_empty(),
            Data::ZSet(z) => z.is_empty(),
            Data::List(l) => l.is_empty(),
            Data::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Duration>,
}

/// Translate Redis-style inclusive indices into a slice range.
pub(crate) fn inclusive_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn by_score(z: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    let mut items: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    items.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    items
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    entries: BTreeMap<String, Entry>,
    now: Duration,
}

impl Store {
    /// Fix the store time for one pipeline and drop expired keys.
    pub(crate) fn begin(&mut self, now: Duration) -> usize {
        self.now = now;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        before - self.entries.len()
    }

    pub(crate) fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn kind(&self, key: &str) -> Option<KeyKind> {
        self.entries.get(key).map(|e| e.data.kind())
    }

    pub(crate) fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let at = self.entries.get(key)?.expires_at?;
        Some(at.saturating_sub(self.now))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    // ==================== typed access ====================

    fn data(&self, key: &str) -> Option<&Data> {
        self.entries.get(key).map(|e| &e.data)
    }

    fn set_ref(&self, key: &str) -> StoreResult<Option<&BTreeSet<String>>> {
        match self.data(key) {
            None => Ok(None),
            Some(Data::Set(s)) => Ok(Some(s)),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn zset_ref(&self, key: &str) -> StoreResult<Option<&BTreeMap<String, f64>>> {
        match self.data(key) {
            None => Ok(None),
            Some(Data::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn list_ref(&self, key: &str) -> StoreResult<Option<&Vec<String>>> {
        match self.data(key) {
            None => Ok(None),
            Some(Data::List(l)) => Ok(Some(l)),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn hash_ref(&self, key: &str) -> StoreResult<Option<&BTreeMap<String, String>>> {
        match self.data(key) {
            None => Ok(None),
            Some(Data::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn data_mut(&mut self, key: &str, empty: Data) -> StoreResult<&mut Data> {
        let kind = empty.kind();
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            data: empty,
            expires_at: None,
        });
        if entry.data.kind() == kind {
            Ok(&mut entry.data)
        } else {
            Err(WRONGTYPE.to_string())
        }
    }

    /// Remove a collection that became empty.
    fn prune(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.data.is_empty()) {
            self.entries.remove(key);
        }
    }

    /// Overwrite a key; an empty collection deletes it.
    fn replace(&mut self, key: &str, data: Data) {
        if data.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(
                key.to_string(),
                Entry {
                    data,
                    expires_at: None,
                },
            );
        }
    }

    /// Members of a set, sorted set or list.
    pub(crate) fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.data(key) {
            None => Ok(Vec::new()),
            Some(Data::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(Data::ZSet(z)) => Ok(by_score(z).into_iter().map(|(m, _)| m).collect()),
            Some(Data::List(l)) => Ok(l.clone()),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    /// Members with scores; plain set members score 1.
    fn scored(&self, key: &str) -> StoreResult<BTreeMap<String, f64>> {
        match self.data(key) {
            None => Ok(BTreeMap::new()),
            Some(Data::Set(s)) => Ok(s.iter().map(|m| (m.clone(), 1.0)).collect()),
            Some(Data::ZSet(z)) => Ok(z.clone()),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn plain_sets(&self, keys: &[String]) -> StoreResult<Vec<BTreeSet<String>>> {
        keys.iter()
            .map(|k| Ok(self.set_ref(k)?.cloned().unwrap_or_default()))
            .collect()
    }

    // ==================== primitives ====================

    pub(crate) fn del(&mut self, keys: &[String]) -> i64 {
        keys.iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count() as i64
    }

    pub(crate) fn incr(&mut self, key: &str) -> StoreResult<i64> {
        let current = match self.data(key) {
            None => 0,
            Some(Data::Str(s)) => s.parse::<i64>().map_err(|_| NOT_INTEGER.to_string())?,
            Some(_) => return Err(WRONGTYPE.to_string()),
        };
        let next = current.checked_add(1).ok_or_else(|| NOT_INTEGER.to_string())?;
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    pub(crate) fn sadd(&mut self, key: &str, members: &[String]) -> StoreResult<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let Data::Set(set) = self.data_mut(key, Data::Set(BTreeSet::new()))? else {
            return Err(WRONGTYPE.to_string());
        };
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count() as i64)
    }

    pub(crate) fn srem(&mut self, key: &str, members: &[String]) -> StoreResult<i64> {
        let removed = match self.entries.get_mut(key).map(|e| &mut e.data) {
            None => 0,
            Some(Data::Set(set)) => members.iter().filter(|m| set.remove(m.as_str())).count(),
            Some(_) => return Err(WRONGTYPE.to_string()),
        };
        self.prune(key);
        Ok(removed as i64)
    }

    pub(crate) fn zadd(&mut self, key: &str, items: &[(f64, String)]) -> StoreResult<i64> {
        if items.is_empty() {
            return Ok(0);
        }
        let Data::ZSet(zset) = self.data_mut(key, Data::ZSet(BTreeMap::new()))? else {
            return Err(WRONGTYPE.to_string());
        };
        Ok(items
            .iter()
            .filter(|(score, member)| zset.insert(member.clone(), *score).is_none())
            .count() as i64)
    }

    pub(crate) fn zrem(&mut self, key: &str, members: &[String]) -> StoreResult<i64> {
        let removed = match self.entries.get_mut(key).map(|e| &mut e.data) {
            None => 0,
            Some(Data::ZSet(zset)) => members
                .iter()
                .filter(|m| zset.remove(m.as_str()).is_some())
                .count(),
            Some(_) => return Err(WRONGTYPE.to_string()),
        };
        self.prune(key);
        Ok(removed as i64)
    }

    pub(crate) fn hset(&mut self, key: &str, pairs: &[(String, String)]) -> StoreResult<i64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let Data::Hash(hash) = self.data_mut(key, Data::Hash(BTreeMap::new()))? else {
            return Err(WRONGTYPE.to_string());
        };
        Ok(pairs
            .iter()
            .filter(|(f, v)| hash.insert(f.clone(), v.clone()).is_none())
            .count() as i64)
    }

    pub(crate) fn hdel(&mut self, key: &str, fields: &[String]) -> StoreResult<i64> {
        let removed = match self.entries.get_mut(key).map(|e| &mut e.data) {
            None => 0,
            Some(Data::Hash(hash)) => fields.iter().filter(|f| hash.remove(f.as_str()).is_some()).count(),
            Some(_) => return Err(WRONGTYPE.to_string()),
        };
        self.prune(key);
        Ok(removed as i64)
    }

    pub(crate) fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hash_ref(key)?.and_then(|h| h.get(field).cloned()))
    }

    pub(crate) fn hgetall(&self, key: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        Ok(self.hash_ref(key)?.cloned())
    }

    pub(crate) fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        Ok(self.zset_ref(key)?.and_then(|z| z.get(member).copied()))
    }

    fn combine(aggregate: Aggregate, a: f64, b: f64) -> f64 {
        match aggregate {
            Aggregate::Sum => a + b,
            Aggregate::Min => a.min(b),
            Aggregate::Max => a.max(b),
        }
    }

    fn zstore(
        &mut self,
        dest: &str,
        keys: &[String],
        weights: Option<&[f64]>,
        aggregate: Aggregate,
        intersect: bool,
    ) -> StoreResult<i64> {
        if let Some(w) = weights {
            if w.len() != keys.len() {
                return Err("ERR syntax error".to_string());
            }
        }
        let mut inputs = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let weight = weights.map_or(1.0, |w| w[i]);
            let scored = self.scored(key)?;
            inputs.push(
                scored
                    .into_iter()
                    .map(|(m, s)| (m, s * weight))
                    .collect::<BTreeMap<_, _>>(),
            );
        }
        let mut result: BTreeMap<String, f64> = BTreeMap::new();
        if intersect {
            if let Some((first, rest)) = inputs.split_first() {
                for (member, score) in first {
                    let mut acc = *score;
                    let mut everywhere = true;
                    for other in rest {
                        match other.get(member) {
                            Some(s) => acc = Self::combine(aggregate, acc, *s),
                            None => {
                                everywhere = false;
                                break;
                            }
                        }
                    }
                    if everywhere {
                        result.insert(member.clone(), acc);
                    }
                }
            }
        } else {
            for input in inputs {
                for (member, score) in input {
                    result
                        .entry(member)
                        .and_modify(|acc| *acc = Self::combine(aggregate, *acc, score))
                        .or_insert(score);
                }
            }
        }
        let n = result.len() as i64;
        self.replace(dest, Data::ZSet(result));
        Ok(n)
    }

    fn sort(
        &mut self,
        key: &str,
        by: Option<&str>,
        desc: bool,
        alpha: bool,
        store: Option<&str>,
    ) -> StoreResult<Reply> {
        let items = self.members(key)?;
        let weight = |item: &String| -> Option<String> {
            match by {
                None => Some(item.clone()),
                Some(pattern) => self.lookup_pattern(pattern, item),
            }
        };
        let mut sorted: Vec<String> = if alpha {
            let mut keyed: Vec<(String, String)> = items
                .into_iter()
                .map(|item| (weight(&item).unwrap_or_default(), item))
                .collect();
            keyed.sort();
            keyed.into_iter().map(|(_, item)| item).collect()
        } else {
            let mut keyed = Vec::with_capacity(items.len());
            for item in items {
                let score = match weight(&item) {
                    None => 0.0,
                    Some(raw) => raw.parse::<f64>().map_err(|_| NOT_DOUBLE.to_string())?,
                };
                keyed.push((score, item));
            }
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            keyed.into_iter().map(|(_, item)| item).collect()
        };
        if desc {
            sorted.reverse();
        }
        match store {
            Some(dest) => {
                let n = sorted.len() as i64;
                self.replace(dest, Data::List(sorted));
                Ok(Reply::Int(n))
            }
            None => Ok(Reply::List(sorted)),
        }
    }

    /// Resolve a `SORT ... BY` pattern (`key*` or `key*->field`) for one item.
    fn lookup_pattern(&self, pattern: &str, item: &str) -> Option<String> {
        let (key_pattern, field) = match pattern.split_once("->") {
            Some((k, f)) => (k, Some(f)),
            None => (pattern, None),
        };
        let key = key_pattern.replacen('*', item, 1);
        match (self.data(&key), field) {
            (Some(Data::Hash(h)), Some(field)) => h.get(field).cloned(),
            (Some(Data::Str(s)), None) => Some(s.clone()),
            _ => None,
        }
    }

    fn resolve_unique(
        &mut self,
        hash: &str,
        values: &[String],
        dest: &str,
        ids: Option<&str>,
    ) -> StoreResult<i64> {
        let found: Vec<String> = match self.hash_ref(hash)? {
            Some(h) => values.iter().filter_map(|v| h.get(v).cloned()).collect(),
            None => Vec::new(),
        };
        let data = match ids {
            Some(ids) => {
                let universe = self.zset_ref(ids)?;
                Data::ZSet(
                    found
                        .into_iter()
                        .filter_map(|id| universe.and_then(|z| z.get(&id)).map(|s| (id, *s)))
                        .collect(),
                )
            }
            None => Data::Set(found.into_iter().collect()),
        };
        let n = match &data {
            Data::Set(s) => s.len(),
            Data::ZSet(z) => z.len(),
            _ => 0,
        };
        self.replace(dest, data);
        Ok(n as i64)
    }

    // ==================== dispatch ====================

    pub(crate) fn execute(&mut self, command: Command) -> Reply {
        self.dispatch(command).unwrap_or_else(Reply::Error)
    }

    fn dispatch(&mut self, command: Command) -> StoreResult<Reply> {
        match command {
            Command::Get(key) => match self.data(&key) {
                None => Ok(Reply::Nil),
                Some(Data::Str(s)) => Ok(Reply::Text(s.clone())),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::Set(key, value) => {
                self.entries.insert(
                    key,
                    Entry {
                        data: Data::Str(value),
                        expires_at: None,
                    },
                );
                Ok(Reply::Ok)
            }
            Command::Del(keys) => Ok(Reply::Int(self.del(&keys))),
            Command::Exists(key) => Ok(Reply::Int(i64::from(self.entries.contains_key(&key)))),
            Command::Expire(key, secs) => {
                let now = self.now;
                Ok(Reply::Int(match self.entries.get_mut(&key) {
                    Some(entry) => {
                        entry.expires_at = Some(now + Duration::from_secs(secs));
                        1
                    }
                    None => 0,
                }))
            }
            Command::Ttl(key) => Ok(Reply::Int(match self.entries.get(&key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => at.saturating_sub(self.now).as_secs_f64().ceil() as i64,
            })),
            Command::Incr(key) => self.incr(&key).map(Reply::Int),

            Command::SAdd(key, members) => self.sadd(&key, &members).map(Reply::Int),
            Command::SRem(key, members) => self.srem(&key, &members).map(Reply::Int),
            Command::SMembers(key) => Ok(Reply::List(
                self.set_ref(&key)?
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default(),
            )),
            Command::SCard(key) => Ok(Reply::Int(self.set_ref(&key)?.map_or(0, |s| s.len()) as i64)),
            Command::SIsMember(key, member) => Ok(Reply::Int(i64::from(
                self.set_ref(&key)?.is_some_and(|s| s.contains(&member)),
            ))),
            Command::SInterStore { dest, keys } => {
                let sets = self.plain_sets(&keys)?;
                let result: BTreeSet<String> = match sets.split_first() {
                    Some((first, rest)) => first
                        .iter()
                        .filter(|m| rest.iter().all(|s| s.contains(*m)))
                        .cloned()
                        .collect(),
                    None => BTreeSet::new(),
                };
                let n = result.len() as i64;
                self.replace(&dest, Data::Set(result));
                Ok(Reply::Int(n))
            }
            Command::SUnionStore { dest, keys } => {
                let result: BTreeSet<String> = self.plain_sets(&keys)?.into_iter().flatten().collect();
                let n = result.len() as i64;
                self.replace(&dest, Data::Set(result));
                Ok(Reply::Int(n))
            }
            Command::SDiffStore { dest, keys } => {
                let sets = self.plain_sets(&keys)?;
                let result: BTreeSet<String> = match sets.split_first() {
                    Some((first, rest)) => first
                        .iter()
                        .filter(|m| !rest.iter().any(|s| s.contains(*m)))
                        .cloned()
                        .collect(),
                    None => BTreeSet::new(),
                };
                let n = result.len() as i64;
                self.replace(&dest, Data::Set(result));
                Ok(Reply::Int(n))
            }

            Command::ZAdd(key, items) => self.zadd(&key, &items).map(Reply::Int),
            Command::ZRem(key, members) => self.zrem(&key, &members).map(Reply::Int),
            Command::ZRange {
                key,
                start,
                stop,
                rev,
            } => {
                let mut items = self.zset_ref(&key)?.map(by_score).unwrap_or_default();
                if rev {
                    items.reverse();
                }
                Ok(Reply::List(match inclusive_range(items.len(), start, stop) {
                    Some((a, b)) => items[a..=b].iter().map(|(m, _)| m.clone()).collect(),
                    None => Vec::new(),
                }))
            }
            Command::ZCard(key) => Ok(Reply::Int(self.zset_ref(&key)?.map_or(0, |z| z.len()) as i64)),
            Command::ZScore(key, member) => Ok(match self.zscore(&key, &member)? {
                Some(score) => Reply::Float(score),
                None => Reply::Nil,
            }),
            Command::ZInterStore {
                dest,
                keys,
                weights,
                aggregate,
            } => self
                .zstore(&dest, &keys, weights.as_deref(), aggregate, true)
                .map(Reply::Int),
            Command::ZUnionStore {
                dest,
                keys,
                weights,
                aggregate,
            } => self
                .zstore(&dest, &keys, weights.as_deref(), aggregate, false)
                .map(Reply::Int),
            Command::ZDiffStore { dest, keys } => {
                let mut inputs = Vec::with_capacity(keys.len());
                for key in &keys {
                    inputs.push(self.scored(key)?);
                }
                let result: BTreeMap<String, f64> = match inputs.split_first() {
                    Some((first, rest)) => first
                        .iter()
                        .filter(|(m, _)| !rest.iter().any(|r| r.contains_key(*m)))
                        .map(|(m, s)| (m.clone(), *s))
                        .collect(),
                    None => BTreeMap::new(),
                };
                let n = result.len() as i64;
                self.replace(&dest, Data::ZSet(result));
                Ok(Reply::Int(n))
            }

            Command::HSet(key, pairs) => self.hset(&key, &pairs).map(Reply::Int),
            Command::HGet(key, field) => Ok(match self.hget(&key, &field)? {
                Some(v) => Reply::Text(v),
                None => Reply::Nil,
            }),
            Command::HDel(key, fields) => self.hdel(&key, &fields).map(Reply::Int),
            Command::HGetAll(key) => Ok(Reply::Pairs(
                self.hgetall(&key)?
                    .map(|h| h.into_iter().collect())
                    .unwrap_or_default(),
            )),
            Command::HMGet(key, fields) => {
                let hash = self.hash_ref(&key)?;
                Ok(Reply::Optional(
                    fields
                        .iter()
                        .map(|f| hash.and_then(|h| h.get(f).cloned()))
                        .collect(),
                ))
            }

            Command::RPush(key, items) => {
                let Data::List(list) = self.data_mut(&key, Data::List(Vec::new()))? else {
                    return Err(WRONGTYPE.to_string());
                };
                list.extend(items);
                let n = list.len() as i64;
                self.prune(&key);
                Ok(Reply::Int(n))
            }
            Command::LRange { key, start, stop } => {
                let list = self.list_ref(&key)?;
                let len = list.map_or(0, Vec::len);
                Ok(Reply::List(match (list, inclusive_range(len, start, stop)) {
                    (Some(list), Some((a, b))) => list[a..=b].to_vec(),
                    _ => Vec::new(),
                }))
            }
            Command::LLen(key) => Ok(Reply::Int(self.list_ref(&key)?.map_or(0, Vec::len) as i64)),

            Command::Sort {
                key,
                by,
                desc,
                alpha,
                store,
            } => self.sort(&key, by.as_deref(), desc, alpha, store.as_deref()),

            Command::Eval(Script::ResolveUnique {
                hash,
                values,
                dest,
                ids,
            }) => self
                .resolve_unique(&hash, &values, &dest, ids.as_deref())
                .map(Reply::Int),
            Command::Eval(Script::Commit(commit)) => Ok(Reply::Commit(script::commit(self, commit)?)),
        }
    }
}
