//! Clock abstractions used by the limiter and its janitor.
//!
//! All times are milliseconds since the Unix epoch so they can be echoed in
//! `X-RateLimit-Reset` and `blockedUntil` without conversion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_millis(&self) -> u64;
}

fn wall_clock_millis() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
}

/// Epoch-anchored monotonic clock.
///
/// Reads the wall clock once at construction and then advances with
/// `Instant::elapsed()`, so a host clock stepping backwards cannot shorten an
/// active block. Values drift from the wall clock by whatever adjustment the
/// host applied after construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch_at_start: u64,
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { epoch_at_start: wall_clock_millis(), start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_at_start.saturating_add(elapsed)
    }
}

/// Wall clock read on every call. May jump when the host clock is adjusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        wall_clock_millis()
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_millis)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time (may go backwards).
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
