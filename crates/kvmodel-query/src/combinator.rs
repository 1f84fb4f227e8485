//! Combinator trees: immutable set-algebra descriptions of a query.

use std::fmt;
use std::sync::Arc;

use kvmodel_core::{ModelMeta, SessionId, Value};

/// Lookup operator of a selection leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Membership in a value set (`field`, `field__in`, `field__eq`)
    In,
}

impl Lookup {
    /// Split a criterion key into field name and lookup.
    ///
    /// Returns the unrecognised suffix as the error.
    pub fn parse(key: &str) -> (&str, Result<Lookup, &str>) {
        match key.split_once("__") {
            None => (key, Ok(Lookup::In)),
            Some((field, "in" | "eq")) => (field, Ok(Lookup::In)),
            Some((field, suffix)) => (field, Err(suffix)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CombinatorKind {
    /// Ids whose `field` value is one of `values`
    Selection {
        field: String,
        lookup: Lookup,
        values: Vec<Value>,
    },
    Union(Vec<Combinator>),
    /// No children: every id of the model
    Intersect(Vec<Combinator>),
    /// First child minus the union of the rest
    Difference(Vec<Combinator>),
    /// Matches nothing
    Empty,
}

/// A node of a query tree, tagged with its model and session.
#[derive(Clone)]
pub struct Combinator {
    kind: CombinatorKind,
    meta: Arc<ModelMeta>,
    session: Option<SessionId>,
}

impl PartialEq for Combinator {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.meta.name == other.meta.name && self.session == other.session
    }
}

impl fmt::Debug for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combinator")
            .field("model", &self.meta.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Combinator {
    /// Build a node as given, without normalisation.
    pub fn new(meta: Arc<ModelMeta>, session: Option<SessionId>, kind: CombinatorKind) -> Self {
        Self {
            kind,
            meta,
            session,
        }
    }

    pub fn empty(meta: Arc<ModelMeta>, session: Option<SessionId>) -> Self {
        Self::new(meta, session, CombinatorKind::Empty)
    }

    /// Every id of the model.
    pub fn universe(meta: Arc<ModelMeta>, session: Option<SessionId>) -> Self {
        Self::new(meta, session, CombinatorKind::Intersect(Vec::new()))
    }

    /// Selection leaf; an empty value set matches nothing.
    pub fn selection(
        meta: Arc<ModelMeta>,
        session: Option<SessionId>,
        field: impl Into<String>,
        values: Vec<Value>,
    ) -> Self {
        if values.is_empty() {
            return Self::empty(meta, session);
        }
        Self::new(
            meta,
            session,
            CombinatorKind::Selection {
                field: field.into(),
                lookup: Lookup::In,
                values,
            },
        )
    }

    /// Intersection. Any empty child empties it; a single child stands alone.
    pub fn intersect(
        meta: Arc<ModelMeta>,
        session: Option<SessionId>,
        mut children: Vec<Combinator>,
    ) -> Self {
        if children.iter().any(Combinator::is_empty) {
            return Self::empty(meta, session);
        }
        if children.len() == 1 {
            if let Some(only) = children.pop() {
                return only;
            }
        }
        Self::new(meta, session, CombinatorKind::Intersect(children))
    }

    /// Union. Empty children are dropped.
    pub fn union(
        meta: Arc<ModelMeta>,
        session: Option<SessionId>,
        children: Vec<Combinator>,
    ) -> Self {
        let mut children: Vec<_> = children.into_iter().filter(|c| !c.is_empty()).collect();
        match children.len() {
            0 => Self::empty(meta, session),
            1 => children.pop().unwrap_or_else(|| Self::empty(Arc::clone(&meta), session)),
            _ => Self::new(meta, session, CombinatorKind::Union(children)),
        }
    }

    /// `head` minus the union of `tails`.
    pub fn difference(head: Combinator, tails: Vec<Combinator>) -> Self {
        if head.is_empty() {
            return head;
        }
        let tails: Vec<_> = tails.into_iter().filter(|c| !c.is_empty()).collect();
        if tails.is_empty() {
            return head;
        }
        let meta = Arc::clone(&head.meta);
        let session = head.session;
        let mut children = Vec::with_capacity(tails.len() + 1);
        children.push(head);
        children.extend(tails);
        Self::new(meta, session, CombinatorKind::Difference(children))
    }

    pub fn kind(&self) -> &CombinatorKind {
        &self.kind
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, CombinatorKind::Empty)
    }

    pub fn is_universe(&self) -> bool {
        matches!(&self.kind, CombinatorKind::Intersect(children) if children.is_empty())
    }

    pub fn children(&self) -> &[Combinator] {
        match &self.kind {
            CombinatorKind::Union(c) | CombinatorKind::Intersect(c) | CombinatorKind::Difference(c) => c,
            CombinatorKind::Selection { .. } | CombinatorKind::Empty => &[],
        }
    }
}
