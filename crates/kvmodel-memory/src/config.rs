//! Configuration for the in-process store.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source used for key expiry.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    /// Wall-clock time
    #[default]
    System,
    /// Test clock that only moves when advanced
    Manual(ManualClock),
}

impl Clock {
    pub fn manual() -> Self {
        Clock::Manual(ManualClock::default())
    }
}

/// Shared, explicitly advanced elapsed time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Store time, measured from store creation.
#[derive(Debug)]
pub(crate) struct TimeSource {
    clock: Clock,
    epoch: Instant,
}

impl TimeSource {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            clock,
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> Duration {
        match &self.clock {
            Clock::System => self.epoch.elapsed(),
            Clock::Manual(manual) => manual.elapsed(),
        }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }
}

/// Configuration for a [`MemoryConnector`](crate::MemoryConnector).
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    pub clock: Clock,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Config with a manual test clock.
    pub fn manual_clock() -> Self {
        Self::new().clock(Clock::manual())
    }
}
