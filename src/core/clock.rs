//! Monotonic millisecond clock shared by the cache, scheduler and refresher.

use crate::prelude::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Milliseconds since the owning clock's epoch.
pub type Timestamp = u64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock backed by `instant::Instant` so it also works on wasm targets
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch: instant::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: instant::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }
}

/// Hand-driven clock for tests and deterministic replays.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
