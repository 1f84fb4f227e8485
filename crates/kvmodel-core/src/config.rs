//! Backend configuration shared by queries and sessions.

use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Default lifetime of temporary query keys.
pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(30);

/// Default prefix for every key the mapper writes.
pub const DEFAULT_NAMESPACE: &str = "kvm.";

/// Key layout and query settings for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Prefix prepended to every model key
    pub namespace: String,
    /// Expiry applied to every temporary key created while lowering a query
    pub query_ttl: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            query_ttl: DEFAULT_QUERY_TTL,
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn query_ttl(mut self, ttl: Duration) -> Self {
        self.query_ttl = ttl;
        self
    }

    /// TTL in whole seconds, as `EXPIRE` takes it.
    pub fn query_ttl_secs(&self) -> u64 {
        self.query_ttl.as_secs().max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_ttl.as_secs() == 0 {
            return Err(ConfigError {
                message: format!(
                    "query_ttl must be at least one second, got {:?}",
                    self.query_ttl
                ),
            }
            .into());
        }
        if self.namespace.chars().any(|c| c.is_whitespace() || c == '*') {
            return Err(ConfigError {
                message: format!("namespace {:?} contains a reserved character", self.namespace),
            }
            .into());
        }
        Ok(())
    }
}
