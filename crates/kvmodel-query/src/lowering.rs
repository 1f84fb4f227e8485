//! Lowering of combinator trees into store commands.
//!
//! Lowering is pure: it produces the command list, the key holding the
//! result and the temporary keys it creates. Executing the commands is the
//! job of [`BackendQuery`](crate::BackendQuery), in one pipelined round trip.
//!
//! Models with a default ordering keep their id collection and indices in
//! sorted sets scored by the ordering field. Lowering preserves that: every
//! intermediate key of an ordered model is a sorted set carrying the same
//! scores, so the final key is already in storage order.

use std::collections::BTreeSet;

use kvmodel_core::{
    Aggregate, Command, Error, FieldInfo, ModelMeta, Ordering, QueryErrorKind, Result, Script,
    Value,
};

use crate::combinator::{Combinator, CombinatorKind};

/// How the ids of a result are read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reader {
    /// Nothing matches; no backend contact needed
    Empty,
    /// Unordered set, sliced client-side
    Set(String),
    /// Sorted set in score order, reversed when `rev`
    ZSet { key: String, rev: bool },
    /// List produced by `SORT ... STORE`
    List(String),
}

/// Result of lowering one tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Commands creating the result, to run once before any read
    pub commands: Vec<Command>,
    /// Every temporary key the commands create
    pub temp_keys: Vec<String>,
    /// Unsorted result key; `None` when the tree is empty
    pub source: Option<String>,
    /// Where ordered ids are read from
    pub reader: Reader,
    /// Whether the source is a sorted set
    pub ordered: bool,
    /// A requested sort matched the default ordering
    pub sort_elided: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
    }
}

struct Lowerer<'a> {
    meta: &'a ModelMeta,
    ordered: bool,
    ttl_secs: u64,
    commands: Vec<Command>,
    temp_keys: Vec<String>,
}

impl Lowerer<'_> {
    /// Run a command that creates `dest`, then bound its lifetime.
    fn store_temp(&mut self, dest: String, command: Command) -> String {
        self.commands.push(command);
        self.commands.push(Command::Expire(dest.clone(), self.ttl_secs));
        self.temp_keys.push(dest.clone());
        dest
    }

    fn union_store(&mut self, keys: Vec<String>) -> String {
        let dest = self.meta.keys.temp();
        let command = if self.ordered {
            Command::ZUnionStore {
                dest: dest.clone(),
                keys,
                weights: None,
                aggregate: Aggregate::Max,
            }
        } else {
            Command::SUnionStore {
                dest: dest.clone(),
                keys,
            }
        };
        self.store_temp(dest, command)
    }

    fn intersect_store(&mut self, keys: Vec<String>) -> String {
        let dest = self.meta.keys.temp();
        let command = if self.ordered {
            Command::ZInterStore {
                dest: dest.clone(),
                keys,
                weights: None,
                aggregate: Aggregate::Max,
            }
        } else {
            Command::SInterStore {
                dest: dest.clone(),
                keys,
            }
        };
        self.store_temp(dest, command)
    }

    fn diff_store(&mut self, keys: Vec<String>) -> String {
        let dest = self.meta.keys.temp();
        let command = if self.ordered {
            Command::ZDiffStore {
                dest: dest.clone(),
                keys,
            }
        } else {
            Command::SDiffStore {
                dest: dest.clone(),
                keys,
            }
        };
        self.store_temp(dest, command)
    }

    /// Lower a node; `None` means the node matches nothing.
    fn lower(&mut self, node: &Combinator) -> Result<Option<String>> {
        if node.meta().name != self.meta.name {
            return Err(Error::consistency(format!(
                "{} node inside a {} query",
                node.meta().name,
                self.meta.name
            )));
        }
        match node.kind() {
            CombinatorKind::Empty => Ok(None),
            CombinatorKind::Selection { field, values, .. } => self.selection(field, values),
            CombinatorKind::Intersect(children) => {
                if children.is_empty() {
                    return Ok(Some(self.meta.keys.ids()));
                }
                let mut keys = Vec::with_capacity(children.len());
                for child in children {
                    match self.lower(child)? {
                        Some(key) => keys.push(key),
                        None => return Ok(None),
                    }
                }
                if keys.len() == 1 {
                    return Ok(keys.pop());
                }
                Ok(Some(self.intersect_store(keys)))
            }
            CombinatorKind::Union(children) => {
                let mut keys = Vec::with_capacity(children.len());
                for child in children {
                    keys.extend(self.lower(child)?);
                }
                match keys.len() {
                    0 => Ok(None),
                    1 => Ok(keys.pop()),
                    _ => Ok(Some(self.union_store(keys))),
                }
            }
            CombinatorKind::Difference(children) => {
                let Some((head, tails)) = children.split_first().filter(|_| children.len() >= 2) else {
                    return Err(Error::consistency(format!(
                        "difference needs at least two operands, got {}",
                        children.len()
                    )));
                };
                let Some(head) = self.lower(head)? else {
                    return Ok(None);
                };
                let mut keys = vec![head];
                for tail in tails {
                    keys.extend(self.lower(tail)?);
                }
                if keys.len() == 1 {
                    return Ok(keys.pop());
                }
                Ok(Some(self.diff_store(keys)))
            }
        }
    }

    fn field(&self, name: &str) -> Result<&'static FieldInfo> {
        let meta = self.meta;
        let info = meta.fields.iter().find(|f| f.name == name).ok_or_else(|| {
            Error::query(
                QueryErrorKind::UnknownField,
                meta.name,
                Some(name),
                format!("unknown field '{name}'"),
            )
        })?;
        if !info.is_queryable() {
            return Err(Error::query(
                QueryErrorKind::NotIndexed,
                meta.name,
                Some(name),
                format!("field '{name}' is not indexed"),
            ));
        }
        Ok(info)
    }

    fn selection(&mut self, field: &str, values: &[Value]) -> Result<Option<String>> {
        let info = self.field(field)?;
        let encoded: Vec<String> = {
            let mut seen = BTreeSet::new();
            values
                .iter()
                .filter_map(|v| info.field_type.encode(v))
                .filter(|v| seen.insert(v.clone()))
                .collect()
        };
        if encoded.is_empty() {
            return Ok(None);
        }
        let meta = self.meta;
        let keys = &meta.keys;

        if info.primary_key {
            let dest = keys.temp();
            let ids = keys.ids();
            self.commands.push(Command::SAdd(dest.clone(), encoded));
            let restrict = if self.ordered {
                Command::ZInterStore {
                    dest: dest.clone(),
                    keys: vec![ids, dest.clone()],
                    weights: Some(vec![1.0, 0.0]),
                    aggregate: Aggregate::Sum,
                }
            } else {
                Command::SInterStore {
                    dest: dest.clone(),
                    keys: vec![dest.clone(), ids],
                }
            };
            return Ok(Some(self.store_temp(dest, restrict)));
        }

        if info.unique {
            let dest = keys.temp();
            let command = Command::Eval(Script::ResolveUnique {
                hash: keys.unique(info.name),
                values: encoded,
                dest: dest.clone(),
                ids: self.ordered.then(|| keys.ids()),
            });
            return Ok(Some(self.store_temp(dest, command)));
        }

        let mut index_keys: Vec<String> = encoded.iter().map(|v| keys.index(info.name, v)).collect();
        if index_keys.len() == 1 {
            return Ok(index_keys.pop());
        }
        Ok(Some(self.union_store(index_keys)))
    }
}

/// Check that `ordering` names a sortable field of the model.
pub fn check_ordering(meta: &ModelMeta, ordering: &Ordering) -> Result<()> {
    match meta.field(&ordering.field) {
        Some(info) if info.field_type.is_scalar() => Ok(()),
        Some(_) => Err(Error::query(
            QueryErrorKind::Ordering,
            meta.name,
            Some(&ordering.field),
            format!("cannot sort on non-scalar field '{}'", ordering.field),
        )),
        None => Err(Error::query(
            QueryErrorKind::Ordering,
            meta.name,
            Some(&ordering.field),
            format!("cannot sort on unknown field '{}'", ordering.field),
        )),
    }
}

/// Lower `tree`, optionally sorted, with temp keys living `ttl_secs`.
pub fn lower(tree: &Combinator, sort: Option<&Ordering>, ttl_secs: u64) -> Result<Plan> {
    let meta = tree.meta().as_ref();
    let ordered = meta.is_ordered();
    let mut lowerer = Lowerer {
        meta,
        ordered,
        ttl_secs,
        commands: Vec::new(),
        temp_keys: Vec::new(),
    };
    let source = lowerer.lower(tree)?;

    let mut sort_elided = false;
    let reader = match (&source, sort) {
        (None, _) => Reader::Empty,
        (Some(key), None) => match &meta.default_ordering {
            Some(default) => Reader::ZSet {
                key: key.clone(),
                rev: default.descending,
            },
            None => Reader::Set(key.clone()),
        },
        (Some(key), Some(requested)) => {
            check_ordering(meta, requested)?;
            match &meta.default_ordering {
                Some(default) if default.field == requested.field => {
                    sort_elided = true;
                    tracing::debug!(
                        model = meta.name,
                        ordering = %requested,
                        "Sort satisfied by storage order"
                    );
                    Reader::ZSet {
                        key: key.clone(),
                        rev: requested.descending,
                    }
                }
                _ => {
                    let info = meta.field(&requested.field).ok_or_else(|| {
                        Error::consistency("checked ordering field vanished")
                    })?;
                    let dest = meta.keys.temp();
                    let by = if info.primary_key {
                        None
                    } else {
                        Some(meta.keys.sort_pattern(info.name))
                    };
                    let command = Command::Sort {
                        key: key.clone(),
                        by,
                        desc: requested.descending,
                        alpha: !info.field_type.is_numeric(),
                        store: Some(dest.clone()),
                    };
                    Reader::List(lowerer.store_temp(dest, command))
                }
            }
        }
    };

    if !lowerer.temp_keys.is_empty() {
        tracing::debug!(
            model = meta.name,
            temp_keys = lowerer.temp_keys.len(),
            commands = lowerer.commands.len(),
            "Lowered query"
        );
    }

    Ok(Plan {
        commands: lowerer.commands,
        temp_keys: lowerer.temp_keys,
        source,
        reader,
        ordered,
        sort_elided,
    })
}
