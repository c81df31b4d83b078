//! Monotonic time source
//!
//! All dispatcher timestamps are signed nanoseconds on a monotonic timeline
//! ([`Nsecs`]). Event times supplied by producers must come from the same
//! timeline as the dispatcher's clock, otherwise staleness and key repeat
//! deadlines are meaningless.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic timestamp or interval in nanoseconds.
pub type Nsecs = i64;

/// Sentinel for "no deadline".
pub const NSECS_MAX: Nsecs = i64::MAX;

/// Sentinel for "wake immediately".
pub const NSECS_MIN: Nsecs = i64::MIN;

/// Convert milliseconds to [`Nsecs`].
pub const fn millis(ms: i64) -> Nsecs {
    ms * 1_000_000
}

/// Convert an [`Nsecs`] interval to milliseconds for display.
pub fn as_millis_f64(ns: Nsecs) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    /// Current time on the monotonic timeline.
    fn now(&self) -> Nsecs;
}

/// Wall-independent clock anchored at construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose zero is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Nsecs {
        // Saturates after ~292 years of uptime.
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(NSECS_MAX)
    }
}

/// Manually advanced clock for deterministic tests and benches.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: Nsecs) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: Nsecs) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move time forward by `delta` nanoseconds.
    pub fn advance(&self, delta: Nsecs) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Move time forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.advance(millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nsecs {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert an absolute wakeup time into a poll timeout relative to `now`.
///
/// `None` means wait indefinitely. Deadlines in the past yield a zero timeout.
/// Sub-millisecond remainders round up so the poll never returns early.
pub fn poll_timeout(now: Nsecs, wakeup: Nsecs) -> Option<Duration> {
    if wakeup == NSECS_MAX {
        return None;
    }
    if wakeup <= now {
        return Some(Duration::ZERO);
    }
    let delta = wakeup.saturating_sub(now);
    let ms = (delta + 999_999) / 1_000_000;
    Some(Duration::from_millis(ms as u64))
}
