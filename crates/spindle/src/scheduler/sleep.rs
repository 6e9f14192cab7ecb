//! Sleep thread
//!
//! One dedicated thread owns a min-heap of pending sleeps. It completes
//! expired sleeps in deadline order, busy-spins through the last stretch of
//! short waits, and otherwise blocks on a condvar with a capped timeout so a
//! newly queued earlier sleep can cut the wait short.

use crate::error::Error;
use crate::future::TaskFuture;
use crate::time::{duration_from_ticks, ticks_from_duration, TimeSource};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Added to every remaining wait so the thread does not wake slightly early
pub const WAKE_FUDGE: Duration = Duration::from_micros(50);

/// Waits shorter than this are spun instead of slept
pub const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// Timed waits shorter than this are unreliable at OS timer resolution
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Longest single blocking wait
pub const MAX_WAIT: Duration = Duration::from_millis(50);

/// Entry in the sleep heap
struct SleepEntry {
    /// Tick count at which to complete
    wake_at: u64,
    /// Insertion order, so equal deadlines complete FIFO
    seq: u64,
    future: TaskFuture<()>,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for SleepEntry {}

struct SleepState {
    sleeping: BinaryHeap<SleepEntry>,
    next_seq: u64,
    /// Set whenever the heap changes; cleared by the sleep thread before it blocks
    signalled: bool,
}

struct SleepShared {
    state: Mutex<SleepState>,
    wake: Condvar,
    shutdown: AtomicBool,
    time: Arc<dyn TimeSource>,
}

/// Dedicated thread servicing timed sleeps
pub struct SleepWorker {
    shared: Arc<SleepShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SleepWorker {
    /// Spawn the sleep thread
    pub fn start(time: Arc<dyn TimeSource>) -> Self {
        let shared = Arc::new(SleepShared {
            state: Mutex::new(SleepState {
                sleeping: BinaryHeap::new(),
                next_seq: 0,
                signalled: false,
            }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            time,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("spindle-sleep".to_string())
            .spawn(move || Self::run_loop(&thread_shared))
            .expect("Failed to spawn sleep thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Complete `future` once the time source reaches `wake_at`.
    ///
    /// A deadline that has already passed completes the future on the calling
    /// thread without touching the heap.
    pub fn queue_sleep(&self, wake_at: u64, future: TaskFuture<()>) {
        if wake_at <= self.shared.time.now() {
            future.complete(());
            return;
        }
        if self.shared.shutdown.load(AtomicOrdering::Acquire) {
            future.fail(Error::Disposed);
            return;
        }

        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleeping.push(SleepEntry {
            wake_at,
            seq,
            future,
        });
        state.signalled = true;
        // The new entry may be earlier than whatever the thread is waiting for
        self.shared.wake.notify_one();
    }

    /// Number of sleeps still waiting for their deadline
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().sleeping.len()
    }

    /// Wake the sleep thread so it re-reads the time source.
    ///
    /// Only needed when a manually driven time source jumps forward.
    pub fn nudge(&self) {
        let mut state = self.shared.state.lock();
        state.signalled = true;
        self.shared.wake.notify_one();
    }

    pub fn time(&self) -> &Arc<dyn TimeSource> {
        &self.shared.time
    }

    /// Stop the sleep thread. Sleeps still pending fail with `Error::Disposed`.
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.signalled = true;
            self.shared.wake.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let start = Instant::now();
                let timeout = Duration::from_secs(2);
                loop {
                    if handle.is_finished() {
                        if handle.join().is_err() {
                            log::error!("Sleep thread panicked");
                        }
                        break;
                    }
                    if start.elapsed() > timeout {
                        log::warn!("Sleep thread did not stop within {:?}", timeout);
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let abandoned = std::mem::take(&mut self.shared.state.lock().sleeping);
        for entry in abandoned {
            let _ = entry.future.try_fail(Error::Disposed);
        }
    }

    /// Sleep thread main loop
    fn run_loop(shared: &SleepShared) {
        let spin_threshold = ticks_from_duration(SPIN_THRESHOLD);
        let fudge = ticks_from_duration(WAKE_FUDGE);
        let mut state = shared.state.lock();

        loop {
            if shared.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = shared.time.now();
            let Some(next) = state.sleeping.peek() else {
                // Nothing to do until someone queues a sleep
                if !state.signalled {
                    shared.wake.wait(&mut state);
                }
                state.signalled = false;
                continue;
            };

            if next.wake_at <= now {
                if let Some(entry) = state.sleeping.pop() {
                    log::trace!("Sleep due at {} serviced at {}", entry.wake_at, now);
                    // Continuations may queue further sleeps; run them unlocked
                    MutexGuard::unlocked(&mut state, || {
                        let _ = entry.future.try_complete(());
                    });
                }
                continue;
            }

            let deadline = next.wake_at;
            let remaining = deadline - now + fudge;

            if remaining < spin_threshold {
                MutexGuard::unlocked(&mut state, || {
                    let backoff = Backoff::new();
                    while shared.time.now() < deadline
                        && !shared.shutdown.load(AtomicOrdering::Acquire)
                    {
                        backoff.spin();
                    }
                });
                continue;
            }

            // Sleep until the spin window, never longer than MAX_WAIT
            let wait = duration_from_ticks(remaining - spin_threshold).min(MAX_WAIT);
            if wait > MIN_SLEEP {
                state.signalled = false;
                shared.wake.wait_for(&mut state, wait);
            } else {
                MutexGuard::unlocked(&mut state, thread::yield_now);
            }
        }

        log::debug!("Sleep thread shutting down");
    }
}

impl Drop for SleepWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualTime, MonotonicTime, TICKS_PER_MILLISECOND, TICKS_PER_SECOND};

    fn monotonic() -> Arc<dyn TimeSource> {
        Arc::new(MonotonicTime::new())
    }

    #[test]
    fn test_sleep_worker_creation() {
        let worker = SleepWorker::start(monotonic());
        assert_eq!(worker.pending_count(), 0);
        worker.stop();
    }

    #[test]
    fn test_past_deadline_completes_without_enqueue() {
        let time = Arc::new(ManualTime::new(10 * TICKS_PER_SECOND));
        let worker = SleepWorker::start(time.clone());

        let future = TaskFuture::new();
        worker.queue_sleep(5 * TICKS_PER_SECOND, future.clone());
        assert!(future.is_completed());
        assert_eq!(worker.pending_count(), 0);

        let now = TaskFuture::new();
        worker.queue_sleep(time.now(), now.clone());
        assert!(now.is_completed());
        assert_eq!(worker.pending_count(), 0);
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let time = monotonic();
        let worker = SleepWorker::start(time.clone());

        let start = time.now();
        let wake_at = start + 20 * TICKS_PER_MILLISECOND;
        let future = TaskFuture::new();
        worker.queue_sleep(wake_at, future.clone());
        assert_eq!(worker.pending_count(), 1);

        future.result_timeout(Duration::from_secs(2)).unwrap();
        assert!(time.now() >= wake_at);
        assert_eq!(worker.pending_count(), 0);
        worker.stop();
    }

    #[test]
    fn test_sleeps_complete_in_deadline_order() {
        let time = monotonic();
        let worker = SleepWorker::start(time.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let base = time.now();
        let offsets = [40u64, 10, 30, 5, 20];
        let futures: Vec<_> = offsets
            .iter()
            .map(|&ms| {
                let future = TaskFuture::new();
                let order = order.clone();
                future.on_complete(move |_, _: &crate::error::Result<()>| order.lock().push(ms));
                worker.queue_sleep(base + ms * TICKS_PER_MILLISECOND, future.clone());
                future
            })
            .collect();

        for future in &futures {
            future.result_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(*order.lock(), vec![5, 10, 20, 30, 40]);
        worker.stop();
    }

    #[test]
    fn test_earlier_sleep_preempts_long_wait() {
        let time = monotonic();
        let worker = SleepWorker::start(time.clone());

        let late = TaskFuture::new();
        worker.queue_sleep(time.now() + 10 * TICKS_PER_SECOND, late.clone());
        thread::sleep(Duration::from_millis(5));

        let early = TaskFuture::new();
        worker.queue_sleep(time.now() + 5 * TICKS_PER_MILLISECOND, early.clone());
        early.result_timeout(Duration::from_millis(500)).unwrap();
        assert!(!late.is_completed());
        worker.stop();
    }

    #[test]
    fn test_manual_time_advance() {
        let time = Arc::new(ManualTime::new(0));
        let worker = SleepWorker::start(time.clone());

        let future = TaskFuture::new();
        worker.queue_sleep(TICKS_PER_SECOND, future.clone());
        thread::sleep(Duration::from_millis(5));
        assert!(!future.is_completed());

        time.advance(TICKS_PER_SECOND);
        worker.nudge();
        future.result_timeout(Duration::from_secs(1)).unwrap();
        worker.stop();
    }

    #[test]
    fn test_stop_fails_pending_sleeps() {
        let time = monotonic();
        let worker = SleepWorker::start(time.clone());
        let future = TaskFuture::new();
        worker.queue_sleep(time.now() + 60 * TICKS_PER_SECOND, future.clone());

        worker.stop();
        assert!(matches!(future.try_result(), Some(Err(Error::Disposed))));

        let after = TaskFuture::new();
        worker.queue_sleep(time.now() + TICKS_PER_SECOND, after.clone());
        assert!(matches!(after.try_result(), Some(Err(Error::Disposed))));
    }

    /// Panics on every read once armed
    struct FaultyTime {
        armed: AtomicBool,
    }

    impl TimeSource for FaultyTime {
        fn now(&self) -> u64 {
            if self.armed.load(AtomicOrdering::Acquire) {
                panic!("time source failed");
            }
            0
        }
    }

    #[test]
    fn test_stop_after_sleep_thread_panicked() {
        let time = Arc::new(FaultyTime {
            armed: AtomicBool::new(false),
        });
        let worker = SleepWorker::start(time.clone());

        time.armed.store(true, AtomicOrdering::Release);
        worker.nudge();

        let start = Instant::now();
        while !worker.handle.lock().as_ref().is_some_and(|h| h.is_finished()) {
            assert!(start.elapsed() < Duration::from_secs(2), "sleep thread should have died");
            thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert!(worker.handle.lock().is_none());
    }

    #[test]
    fn test_sleep_entry_ordering_is_fifo_on_ties() {
        let mut heap = BinaryHeap::new();
        for seq in 0..3 {
            heap.push(SleepEntry {
                wake_at: 100,
                seq,
                future: TaskFuture::new(),
            });
        }
        let popped: Vec<_> = std::iter::from_fn(|| heap.pop().map(|e| e.seq)).collect();
        assert_eq!(popped, vec![0, 1, 2]);
    }
}
