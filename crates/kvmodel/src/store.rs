//! Application entry point tying a model catalog to a connector.
//!
//! # Example
//!
//! ```rust,ignore
//! use kvmodel::prelude::*;
//!
//! let store = StoreBuilder::new()
//!     .namespace("app")
//!     .query_ttl(Duration::from_secs(60))
//!     .register::<Hero>()
//!     .register::<Team>()
//!     .build(MemoryConnector::default())?;
//!
//! let mut session = store.session();
//! ```

use std::sync::Arc;
use std::time::Duration;

use kvmodel_core::{BackendConfig, Connector, Model, ModelCatalog, Result};
use kvmodel_query::Query;
use kvmodel_session::{Session, SessionConfig};

type Registration = fn(&ModelCatalog) -> Result<()>;

/// A catalog of registered models plus the connector every session and
/// query uses.
#[derive(Debug, Clone)]
pub struct Store<C: Connector> {
    catalog: Arc<ModelCatalog>,
    connector: C,
    session_config: SessionConfig,
}

impl<C: Connector> Store<C> {
    /// Wrap an already populated catalog.
    pub fn new(catalog: Arc<ModelCatalog>, connector: C) -> Self {
        Self {
            catalog,
            connector,
            session_config: SessionConfig::default(),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// A fresh session using the store's default session configuration.
    pub fn session(&self) -> Session<C> {
        self.session_with(self.session_config.clone())
    }

    pub fn session_with(&self, config: SessionConfig) -> Session<C> {
        Session::with_config(Arc::clone(&self.catalog), self.connector.clone(), config)
    }

    /// A query not bound to any session.
    pub fn query<M: Model>(&self) -> Result<Query<M, C>> {
        Query::for_model(&self.catalog, self.connector.clone())
    }
}

/// Builder for [`Store`]; the connector type is fixed by `build`.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    config: BackendConfig,
    session_config: SessionConfig,
    registrations: Vec<Registration>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for every key the store writes.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config = self.config.namespace(namespace);
        self
    }

    /// Lifetime of temporary query keys.
    pub fn query_ttl(mut self, ttl: Duration) -> Self {
        self.config = self.config.query_ttl(ttl);
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Register a model; registration errors surface from `build`.
    pub fn register<M: Model>(mut self) -> Self {
        self.registrations
            .push(|catalog| catalog.register::<M>().map(|_| ()));
        self
    }

    /// Validate the configuration, register every model and bind the
    /// connector.
    pub fn build<C: Connector>(self, connector: C) -> Result<Store<C>> {
        let catalog = ModelCatalog::new(self.config)?;
        for register in &self.registrations {
            register(&catalog)?;
        }
        tracing::debug!(
            namespace = %catalog.config().namespace,
            models = catalog.models().len(),
            "Store built"
        );
        Ok(Store {
            catalog: Arc::new(catalog),
            connector,
            session_config: self.session_config,
        })
    }
}
