//! Periodic clock built on the sleep thread

use crate::future::TaskFuture;
use crate::scheduler::SchedulerHandle;
use crate::time::ticks_from_duration;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-interval clock
///
/// Boundaries are `start + k * interval`. A caller that falls more than one
/// interval behind skips the missed boundaries instead of receiving a burst of
/// immediate ticks.
pub struct Ticker {
    scheduler: SchedulerHandle,
    interval: u64,
    next_deadline: Mutex<u64>,
    ticks: Arc<AtomicU64>,
}

impl Ticker {
    pub(crate) fn new(scheduler: SchedulerHandle, interval: Duration) -> Self {
        let interval = ticks_from_duration(interval).max(1);
        let start = scheduler.time_source().now();
        Self {
            scheduler,
            interval,
            next_deadline: Mutex::new(start.saturating_add(interval)),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Future completing at the next boundary
    pub fn next_tick(&self) -> TaskFuture<()> {
        let now = self.scheduler.time_source().now();
        let deadline = {
            let mut next = self.next_deadline.lock();
            if now > *next {
                let missed = (now - *next) / self.interval;
                *next += missed * self.interval;
            }
            let deadline = *next;
            *next = next.saturating_add(self.interval);
            deadline
        };

        let future = TaskFuture::new();
        let ticks = Arc::clone(&self.ticks);
        future.on_complete(move |_, result| {
            if result.is_ok() {
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        });
        self.scheduler.queue_sleep(deadline, future.clone());
        future
    }

    /// Interval in ticks
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Number of boundaries reached so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}
