//! Lazy query builder.
//!
//! A [`Query`] accumulates criteria without touching the backend. The
//! combinator tree is built on first need by [`Query::construct`], which is
//! where every usage error surfaces; the lowered [`BackendQuery`] is cached
//! alongside it, so repeated result operations reuse the same temporary keys.
//!
//! # Example
//!
//! ```ignore
//! let planets = session
//!     .query::<Star>()?
//!     .filter("group", "planet")
//!     .exclude("name", "Pluto")
//!     .sort_by("-score");
//! let top = planets.slice(&cx, 0, Some(3)).await;
//! ```

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use asupersync::{Cx, Outcome};
use kvmodel_core::{
    Connector, Error, InstanceState, Model, ModelCatalog, ModelMeta, Ordering, QueryErrorKind,
    Record, Result, SessionId, Value, try_outcome,
};

use crate::backend::BackendQuery;
use crate::combinator::{Combinator, Lookup};
use crate::lowering::{check_ordering, lower};
use crate::search::SearchEngine;

/// How a compound query combines its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compound {
    Union,
    Intersect,
}

/// Declarative query over one model.
pub struct Query<M: Model, C: Connector> {
    connector: C,
    meta: Arc<ModelMeta>,
    session: Option<SessionId>,
    ttl_secs: u64,
    filters: Vec<(String, Vec<Value>)>,
    excludes: Vec<(String, Vec<Value>)>,
    compound: Option<(Compound, Vec<Query<M, C>>)>,
    ordering: Option<String>,
    projection: Option<String>,
    load_only: Option<Vec<String>>,
    search: Option<String>,
    search_engine: Option<Arc<dyn SearchEngine>>,
    tree: OnceLock<Combinator>,
    backend: OnceLock<Arc<BackendQuery<C>>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model, C: Connector> Clone for Query<M, C> {
    /// Clones share criteria but not the cached tree or backend handle.
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            meta: Arc::clone(&self.meta),
            session: self.session,
            ttl_secs: self.ttl_secs,
            filters: self.filters.clone(),
            excludes: self.excludes.clone(),
            compound: self.compound.clone(),
            ordering: self.ordering.clone(),
            projection: self.projection.clone(),
            load_only: self.load_only.clone(),
            search: self.search.clone(),
            search_engine: self.search_engine.clone(),
            tree: OnceLock::new(),
            backend: OnceLock::new(),
            _model: PhantomData,
        }
    }
}

impl<M: Model, C: Connector> std::fmt::Debug for Query<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("model", &self.meta.name)
            .field("filters", &self.filters)
            .field("excludes", &self.excludes)
            .field("compound", &self.compound.as_ref().map(|(c, q)| (c, q.len())))
            .field("ordering", &self.ordering)
            .field("projection", &self.projection)
            .field("constructed", &self.tree.get().is_some())
            .finish_non_exhaustive()
    }
}

fn merge(criteria: &mut Vec<(String, Vec<Value>)>, key: String, values: Vec<Value>) {
    match criteria.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => {
            for value in values {
                if !existing.contains(&value) {
                    existing.push(value);
                }
            }
        }
        None => criteria.push((key, values)),
    }
}

impl<M: Model, C: Connector> Query<M, C> {
    /// Query every instance of `M` as registered in `meta`.
    pub fn new(connector: C, meta: Arc<ModelMeta>, ttl_secs: u64) -> Self {
        Self {
            connector,
            meta,
            session: None,
            ttl_secs,
            filters: Vec::new(),
            excludes: Vec::new(),
            compound: None,
            ordering: None,
            projection: None,
            load_only: None,
            search: None,
            search_engine: None,
            tree: OnceLock::new(),
            backend: OnceLock::new(),
            _model: PhantomData,
        }
    }

    /// Query `M` through a catalog, using its temp-key lifetime.
    pub fn for_model(catalog: &ModelCatalog, connector: C) -> Result<Self> {
        let meta = catalog.meta::<M>()?;
        Ok(Self::new(connector, meta, catalog.config().query_ttl_secs()))
    }

    /// Tag the query's tree with the session that issued it.
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self.reset()
    }

    fn reset(mut self) -> Self {
        self.tree = OnceLock::new();
        self.backend = OnceLock::new();
        self
    }

    pub fn meta(&self) -> &Arc<ModelMeta> {
        &self.meta
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    // ==================== Criteria ====================

    /// Match instances whose `key` equals `value`.
    ///
    /// `key` is a field name, optionally with an `__in` / `__eq` lookup.
    /// Repeated criteria on one field widen it to an IN test.
    pub fn filter(self, key: &str, value: impl Into<Value>) -> Self {
        self.filter_in(key, [value.into()])
    }

    /// Match instances whose `key` is one of `values`. An empty set
    /// matches nothing.
    pub fn filter_in<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        merge(
            &mut self.filters,
            key.to_string(),
            values.into_iter().map(Into::into).collect(),
        );
        self.reset()
    }

    /// Drop instances whose `key` equals `value`.
    pub fn exclude(self, key: &str, value: impl Into<Value>) -> Self {
        self.exclude_in(key, [value.into()])
    }

    pub fn exclude_in<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        merge(
            &mut self.excludes,
            key.to_string(),
            values.into_iter().map(Into::into).collect(),
        );
        self.reset()
    }

    fn compound(&self, kind: Compound, others: &[&Query<M, C>]) -> Self {
        let mut operands = Vec::with_capacity(others.len() + 1);
        operands.push(self.clone());
        operands.extend(others.iter().map(|q| (*q).clone()));
        let mut query = Self::new(self.connector.clone(), Arc::clone(&self.meta), self.ttl_secs);
        query.session = self.session;
        query.search_engine = self.search_engine.clone();
        query.ordering = self.ordering.clone();
        query.projection = self.projection.clone();
        query.load_only = self.load_only.clone();
        query.compound = Some((kind, operands));
        query
    }

    /// Instances matching this query or any of `others`.
    pub fn union(&self, others: &[&Query<M, C>]) -> Self {
        self.compound(Compound::Union, others)
    }

    /// Instances matching this query and every one of `others`.
    pub fn intersect(&self, others: &[&Query<M, C>]) -> Self {
        self.compound(Compound::Intersect, others)
    }

    /// Order results by `"field"` or `"-field"`.
    pub fn sort_by(mut self, ordering: &str) -> Self {
        self.ordering = Some(ordering.to_string());
        self.reset()
    }

    /// Project results onto one field; see [`Query::values`].
    pub fn get_field(mut self, field: &str) -> Self {
        self.projection = Some(field.to_string());
        self.reset()
    }

    /// Restrict [`Query::records`] to these fields.
    pub fn load_only(mut self, fields: &[&str]) -> Self {
        self.load_only = Some(fields.iter().map(|f| f.to_string()).collect());
        self.reset()
    }

    /// Narrow results to what the search engine matches for `text`.
    pub fn search(mut self, text: &str) -> Self {
        self.search = Some(text.to_string());
        self.reset()
    }

    pub fn with_search_engine(mut self, engine: Arc<dyn SearchEngine>) -> Self {
        self.search_engine = Some(engine);
        self.reset()
    }

    // ==================== Construction ====================

    fn query_error(&self, kind: QueryErrorKind, field: Option<&str>, message: String) -> Error {
        Error::query(kind, self.meta.name, field, message)
    }

    /// Group criteria into one selection per field.
    fn selections(&self, criteria: &[(String, Vec<Value>)]) -> Result<Vec<Combinator>> {
        let mut grouped: Vec<(&str, Vec<Value>)> = Vec::new();
        for (key, values) in criteria {
            let (field, lookup) = Lookup::parse(key);
            if let Err(suffix) = lookup {
                return Err(self.query_error(
                    QueryErrorKind::UnsupportedLookup,
                    Some(field),
                    format!("unsupported lookup '{suffix}' in '{key}'"),
                ));
            }
            let Some(info) = self.meta.field(field) else {
                return Err(self.query_error(
                    QueryErrorKind::UnknownField,
                    Some(field),
                    format!("unknown field '{field}'"),
                ));
            };
            if !info.is_queryable() {
                return Err(self.query_error(
                    QueryErrorKind::NotIndexed,
                    Some(field),
                    format!("field '{field}' is not indexed"),
                ));
            }
            match grouped.iter_mut().find(|(f, _)| *f == field) {
                Some((_, existing)) => {
                    for value in values {
                        if !existing.contains(value) {
                            existing.push(value.clone());
                        }
                    }
                }
                None => grouped.push((field, values.clone())),
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(field, values)| {
                Combinator::selection(Arc::clone(&self.meta), self.session, field, values)
            })
            .collect())
    }

    fn build_tree(&self) -> Result<Combinator> {
        if let Some(ordering) = &self.ordering {
            check_ordering(&self.meta, &Ordering::parse(ordering))?;
        }
        if let Some(field) = &self.projection {
            self.check_projection(field)?;
        }
        for field in self.load_only.iter().flatten() {
            self.check_projection(field)?;
        }

        let meta = &self.meta;
        let mut parts = Vec::new();

        if let Some((kind, operands)) = &self.compound {
            let mut trees = Vec::with_capacity(operands.len());
            for operand in operands {
                if operand.meta.keys != meta.keys {
                    return Err(self.query_error(
                        QueryErrorKind::ModelMismatch,
                        None,
                        format!(
                            "cannot combine queries over {} and {}",
                            meta.keys.base(),
                            operand.meta.keys.base()
                        ),
                    ));
                }
                trees.push(operand.construct()?.clone());
            }
            parts.push(match kind {
                Compound::Union => Combinator::union(Arc::clone(meta), self.session, trees),
                Compound::Intersect => Combinator::intersect(Arc::clone(meta), self.session, trees),
            });
        }

        parts.extend(self.selections(&self.filters)?);

        if let Some(text) = &self.search {
            let engine = self.search_engine.as_ref().ok_or_else(|| {
                self.query_error(
                    QueryErrorKind::NoSearchEngine,
                    None,
                    "search() needs a search engine".to_string(),
                )
            })?;
            let ids = engine.search(meta, text)?;
            tracing::debug!(model = meta.name, matches = ids.len(), "Search engine matched ids");
            parts.push(Combinator::selection(
                Arc::clone(meta),
                self.session,
                meta.identity.name,
                ids.into_iter().map(Value::Text).collect(),
            ));
        }

        let base = Combinator::intersect(Arc::clone(meta), self.session, parts);
        let excludes = self.selections(&self.excludes)?;
        Ok(Combinator::difference(base, excludes))
    }

    fn check_projection(&self, field: &str) -> Result<()> {
        match self.meta.field(field) {
            Some(_) => Ok(()),
            None => Err(self.query_error(
                QueryErrorKind::NoProjection,
                Some(field),
                format!("cannot project unknown field '{field}'"),
            )),
        }
    }

    /// Build (once) and return the combinator tree.
    ///
    /// All usage errors surface here, before any backend contact.
    pub fn construct(&self) -> Result<&Combinator> {
        if let Some(tree) = self.tree.get() {
            return Ok(tree);
        }
        let tree = self.build_tree()?;
        Ok(self.tree.get_or_init(|| tree))
    }

    /// Lowered backend handle, built once per query.
    pub fn backend(&self) -> Result<Arc<BackendQuery<C>>> {
        if let Some(backend) = self.backend.get() {
            return Ok(Arc::clone(backend));
        }
        let tree = self.construct()?;
        let ordering = self.ordering.as_deref().map(Ordering::parse);
        let plan = lower(tree, ordering.as_ref(), self.ttl_secs)?;
        let backend = BackendQuery::new(self.connector.clone(), Arc::clone(&self.meta), plan);
        Ok(Arc::clone(self.backend.get_or_init(|| Arc::new(backend))))
    }

    // ==================== Results ====================

    fn encode_id(&self, id: &Value) -> Option<String> {
        self.meta.identity.field_type.encode(id)
    }

    fn instantiate(&self, rows: Vec<(String, Record)>) -> Result<Vec<M>> {
        rows.into_iter()
            .map(|(id, record)| {
                let mut model = M::from_record(&id, &record)?;
                *model.state_mut() = InstanceState::loaded();
                Ok(model)
            })
            .collect()
    }

    /// Number of matching instances.
    pub async fn count(&self, cx: &Cx) -> Outcome<u64, Error> {
        let backend = try_outcome!(@result self.backend());
        backend.count(cx).await
    }

    /// Whether the instance with `id` matches.
    pub async fn contains(&self, cx: &Cx, id: impl Into<Value>) -> Outcome<bool, Error> {
        let backend = try_outcome!(@result self.backend());
        match self.encode_id(&id.into()) {
            Some(id) => backend.contains(cx, &id).await,
            None => Outcome::Ok(false),
        }
    }

    /// Matching ids in result order.
    pub async fn ids(&self, cx: &Cx) -> Outcome<Vec<String>, Error> {
        let backend = try_outcome!(@result self.backend());
        backend.ids(cx, 0, None).await
    }

    /// Instances in `start..stop`, with negative indices counting from
    /// the end. `stop = None` runs to the end.
    pub async fn slice(&self, cx: &Cx, start: i64, stop: Option<i64>) -> Outcome<Vec<M>, Error> {
        let backend = try_outcome!(@result self.backend());
        let ids = try_outcome!(backend.ids(cx, start, stop).await);
        let rows = try_outcome!(backend.records(cx, &ids, None).await);
        self.instantiate(rows).map_or_else(Outcome::Err, Outcome::Ok)
    }

    pub async fn all(&self, cx: &Cx) -> Outcome<Vec<M>, Error> {
        self.slice(cx, 0, None).await
    }

    pub async fn first(&self, cx: &Cx) -> Outcome<Option<M>, Error> {
        self.slice(cx, 0, Some(1))
            .await
            .map(|models| models.into_iter().next())
    }

    /// The matching instance with `id`, if any.
    pub async fn get(&self, cx: &Cx, id: impl Into<Value>) -> Outcome<Option<M>, Error> {
        let backend = try_outcome!(@result self.backend());
        let Some(id) = self.encode_id(&id.into()) else {
            return Outcome::Ok(None);
        };
        let tree = try_outcome!(@result self.construct());
        if !tree.is_universe() && !try_outcome!(backend.contains(cx, &id).await) {
            return Outcome::Ok(None);
        }
        let rows = try_outcome!(backend.records(cx, std::slice::from_ref(&id), None).await);
        self.instantiate(rows)
            .map(|models| models.into_iter().next())
            .map_or_else(Outcome::Err, Outcome::Ok)
    }

    /// Values of the projected field, in result order.
    pub async fn values(&self, cx: &Cx) -> Outcome<Vec<Value>, Error> {
        let Some(field) = self.projection.clone() else {
            return Outcome::Err(self.query_error(
                QueryErrorKind::NoProjection,
                None,
                "values() needs get_field()".to_string(),
            ));
        };
        let backend = try_outcome!(@result self.backend());
        let ids = try_outcome!(backend.ids(cx, 0, None).await);
        let fields = [field];
        let rows = try_outcome!(backend.records(cx, &ids, Some(&fields)).await);
        Outcome::Ok(
            rows.into_iter()
                .map(|(_, mut record)| record.remove(&fields[0]).unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Raw records in result order, restricted by `load_only` when set.
    pub async fn records(&self, cx: &Cx) -> Outcome<Vec<Record>, Error> {
        let backend = try_outcome!(@result self.backend());
        let ids = try_outcome!(backend.ids(cx, 0, None).await);
        let rows = try_outcome!(backend.records(cx, &ids, self.load_only.as_deref()).await);
        Outcome::Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}
