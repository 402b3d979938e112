//! Injected monotonic time source
//!
//! The pool's reaper and the health model's TTL/backoff math never read
//! `Instant::now()` directly — everything goes through a `Clock` so
//! tests can advance time deterministically instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// The current instant, as seen by this clock
    fn now(&self) -> Instant;
}

/// The real wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic tests
///
/// Stores an offset from a fixed epoch instant rather than wrapping
/// `Instant` directly, since `Instant` has no public constructor other
/// than `now()`.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a new manual clock pinned to the instant of creation
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by `duration`
    pub fn advance(&self, duration: Duration) {
        self.offset_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonically() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
