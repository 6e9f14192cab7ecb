//! Tick-based time sources
//!
//! The scheduler measures deadlines in ticks of a monotonic counter. The
//! default source counts nanoseconds since it was created; `ManualTime` is
//! advanced by hand for simulations and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ticks in one second
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

/// Ticks in one millisecond
pub const TICKS_PER_MILLISECOND: u64 = TICKS_PER_SECOND / 1_000;

/// Monotonic tick counter
pub trait TimeSource: Send + Sync {
    /// Current tick count. Never decreases.
    fn now(&self) -> u64;
}

/// Convert a duration to ticks, saturating at `u64::MAX`.
pub fn ticks_from_duration(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Convert ticks to a duration.
pub fn duration_from_ticks(ticks: u64) -> Duration {
    Duration::from_nanos(ticks)
}

/// Wall-clock backed time source
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    epoch: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> u64 {
        ticks_from_duration(self.epoch.elapsed())
    }
}

/// Time source that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTime {
    ticks: AtomicU64,
}

impl ManualTime {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: AtomicU64::new(start),
        }
    }

    /// Move time forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Jump to `ticks`. Ignored if it would move time backwards.
    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::AcqRel);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}
