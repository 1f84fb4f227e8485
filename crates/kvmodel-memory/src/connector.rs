//! `Connector` implementation over the in-process store.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use asupersync::{Cx, Outcome};
use kvmodel_core::{
    Command, ConfigError, ConnectionError, ConnectionErrorKind, Connector, Error, Reply, Result,
};

use crate::config::{Clock, MemoryConfig, TimeSource};
use crate::store::{KeyKind, Store};

/// Command counters, for asserting round trips in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Pipelines executed (a single command counts as one)
    pub round_trips: u64,
    /// Commands executed across all pipelines
    pub commands: u64,
    /// Keys dropped by expiry
    pub expired: u64,
}

struct Inner {
    store: Store,
    time: TimeSource,
    stats: MemoryStats,
}

/// A handle to a shared in-process store.
///
/// Clones share the store. The store executes one pipeline at a time:
/// the lock is held for the whole batch, so commands of two clients'
/// pipelines never interleave.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.lock().map(|inner| inner.store.len()).unwrap_or(0);
        f.debug_struct("MemoryConnector")
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryConnector {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                store: Store::default(),
                time: TimeSource::new(config.clock),
                stats: MemoryStats::default(),
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Unavailable,
                message: "memory store lock poisoned".to_string(),
                source: None,
            })
        })
    }

    /// Run a batch atomically.
    fn pipeline_sync(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let mut inner = self.lock()?;
        let now = inner.time.now();
        let expired = inner.store.begin(now);
        inner.stats.round_trips += 1;
        inner.stats.commands += commands.len() as u64;
        inner.stats.expired += expired as u64;
        if expired > 0 {
            tracing::trace!(expired, "Expired keys swept");
        }
        let replies = commands
            .into_iter()
            .map(|command| inner.store.execute(command))
            .collect();
        Ok(replies)
    }

    /// Advance a manual clock. Fails for the system clock.
    pub fn advance(&self, by: Duration) -> Result<()> {
        let inner = self.lock()?;
        match inner.time.clock() {
            Clock::Manual(manual) => {
                manual.advance(by);
                Ok(())
            }
            Clock::System => Err(Error::Config(ConfigError {
                message: "cannot advance the system clock".to_string(),
            })),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().map(|inner| inner.stats).unwrap_or_default()
    }

    pub fn reset_stats(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.stats = MemoryStats::default();
        }
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.with_swept(|store| store.keys(prefix)).unwrap_or_default()
    }

    pub fn key_kind(&self, key: &str) -> Option<KeyKind> {
        self.with_swept(|store| store.kind(key)).ok().flatten()
    }

    /// Remaining lifetime of a key with an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_swept(|store| store.remaining_ttl(key)).ok().flatten()
    }

    pub fn flush_all(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.store.clear();
        }
    }

    fn with_swept<T>(&self, f: impl FnOnce(&Store) -> T) -> Result<T> {
        let mut inner = self.lock()?;
        let now = inner.time.now();
        let expired = inner.store.begin(now);
        inner.stats.expired += expired as u64;
        Ok(f(&inner.store))
    }
}

impl Connector for MemoryConnector {
    fn pipeline(
        &self,
        _cx: &Cx,
        commands: Vec<Command>,
    ) -> impl Future<Output = Outcome<Vec<Reply>, Error>> + Send {
        let result = self.pipeline_sync(commands);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(&self, _cx: &Cx, command: Command) -> impl Future<Output = Outcome<Reply, Error>> + Send {
        let result = self
            .pipeline_sync(vec![command])
            .and_then(|mut replies| replies.pop().ok_or_else(|| Error::protocol("empty reply")));
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}
