//! Monotonic clock abstraction.
//!
//! The session engine needs "now" for trigger quota windows,
//! flush/stop timeouts and periodic ticks (`flush_period_ms`,
//! `file_write_period_ms`). A trait keeps tests able to inject a fake clock
//! instead of racing real wall-clock time.

use std::time::{Duration, Instant};

/// Source of monotonic time for the service.
pub trait Clock: Send + Sync {
    /// Returns a monotonic timestamp. Not comparable across processes.
    fn now(&self) -> Instant;
}

/// `Clock` backed by `std::time::Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Fixed/advanceable clock for deterministic tests.
#[derive(Debug)]
pub struct FakeClock {
    epoch: Instant,
    offset: std::sync::atomic::AtomicU64,
}

impl FakeClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Advances the fake clock by `d`.
    pub fn advance(&self, d: Duration) {
        self.offset
            .fetch_add(d.as_nanos() as u64, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let nanos = self.offset.load(std::sync::atomic::Ordering::SeqCst);
        self.epoch + Duration::from_nanos(nanos)
    }
}
