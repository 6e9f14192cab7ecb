//! Thread pool work queue
//!
//! Workers pull items from a shared crossbeam `Injector`. A panicking item is
//! caught on the worker, logged, and re-raised on the thread that next calls
//! `step()`, so failures surface on the scheduling thread instead of killing
//! a worker.

use crate::error::{Error, Result};
use crate::future::CompletionSignal;
use crate::queue::{WorkItem, WorkQueue};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Idle workers re-check the shutdown flag at least this often
const IDLE_WAIT: Duration = Duration::from_millis(10);

struct PoolShared {
    injector: Injector<WorkItem>,
    /// Queued plus running items
    pending: AtomicUsize,
    lock: Mutex<()>,
    /// Wakes one idle worker per queued item
    work_available: Condvar,
    /// Wakes callers of `wait_for_work_items`
    activity: Condvar,
    shutdown: AtomicBool,
    panics: Mutex<VecDeque<Box<dyn Any + Send>>>,
}

impl PoolShared {
    fn pop(&self) -> Option<WorkItem> {
        loop {
            match self.injector.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

/// Work queue backed by a fixed set of worker threads
pub struct ThreadPoolWorkQueue {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ThreadPoolWorkQueue {
    /// Start `worker_count` workers (at least one)
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            pending: AtomicUsize::new(0),
            lock: Mutex::new(()),
            work_available: Condvar::new(),
            activity: Condvar::new(),
            shutdown: AtomicBool::new(false),
            panics: Mutex::new(VecDeque::new()),
        });

        let handles = (0..worker_count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("spindle-worker-{}", id))
                    .spawn(move || Self::run_loop(id, shared))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Self {
            shared,
            handles: Mutex::new(handles),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Worker thread main loop
    fn run_loop(id: usize, shared: Arc<PoolShared>) {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let Some(item) = shared.pop() else {
                let mut guard = shared.lock.lock();
                // Re-check under the lock: a producer pushes before taking
                // the lock to notify, so an item queued now is visible here.
                if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    shared.work_available.wait_for(&mut guard, IDLE_WAIT);
                }
                continue;
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(item)) {
                log::error!(
                    "Worker {}: work item panicked: {}",
                    id,
                    Error::from_panic(payload.as_ref())
                );
                shared.panics.lock().push_back(payload);
            }
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }

        log::debug!("Worker {} shutting down", id);
    }
}

impl WorkQueue for ThreadPoolWorkQueue {
    fn queue_work_item(&self, item: WorkItem) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            log::warn!("Work item queued after shutdown; dropping it");
            drop(item);
            return Err(Error::Disposed);
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.injector.push(item);

        let _guard = self.shared.lock.lock();
        self.shared.work_available.notify_one();
        self.shared.activity.notify_all();
        Ok(())
    }

    fn step(&self) {
        // Workers run items on their own; stepping only surfaces failures.
        let payload = self.shared.panics.lock().pop_front();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    fn wait_for_work_items(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.lock.lock();
        while self.shared.pending.load(Ordering::Acquire) == 0 {
            if self.shared.activity.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.shared.pending.load(Ordering::Acquire) > 0
    }

    fn wait_for_signal(&self, signal: &CompletionSignal) {
        signal.wait();
    }

    fn count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.lock.lock();
            self.shared.work_available.notify_all();
            self.shared.activity.notify_all();
        }

        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            // A work item that disposes the scheduler runs on a worker; that
            // worker exits on its own once the item returns.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker thread panicked during shutdown");
            }
        }

        let mut dropped = 0;
        while self.shared.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            self.shared.pending.fetch_sub(dropped, Ordering::AcqRel);
            log::debug!("Thread pool shut down with {} pending items", dropped);
        }
    }
}

impl Drop for ThreadPoolWorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::TaskFuture;

    #[test]
    fn test_pool_runs_items() {
        let pool = ThreadPoolWorkQueue::new(2);
        assert_eq!(pool.worker_count(), 2);

        let futures: Vec<TaskFuture<usize>> = (0..16).map(|_| TaskFuture::new()).collect();
        for (i, future) in futures.iter().enumerate() {
            let future = future.clone();
            pool.queue_work_item(Box::new(move || future.complete(i * 2))).unwrap();
        }
        for (i, future) in futures.iter().enumerate() {
            assert_eq!(future.result_timeout(Duration::from_secs(2)).unwrap(), i * 2);
        }
        pool.shutdown();
    }

    #[test]
    fn test_pool_zero_workers_clamps_to_one() {
        let pool = ThreadPoolWorkQueue::new(0);
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_pool_step_reraises_worker_panic() {
        let pool = ThreadPoolWorkQueue::new(1);
        let done = TaskFuture::new();
        let marker = done.clone();
        pool.queue_work_item(Box::new(|| panic!("worker boom"))).unwrap();
        pool.queue_work_item(Box::new(move || marker.complete(()))).unwrap();
        done.result_timeout(Duration::from_secs(2)).unwrap();

        let caught = panic::catch_unwind(AssertUnwindSafe(|| pool.step()));
        let payload = caught.expect_err("step should re-raise the worker panic");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"worker boom"));

        // Only re-raised once
        pool.step();
    }

    #[test]
    fn test_pool_wait_for_work_items() {
        let pool = ThreadPoolWorkQueue::new(1);
        assert!(!pool.wait_for_work_items(Duration::from_millis(5)));
    }

    #[test]
    fn test_pool_shutdown_is_idempotent() {
        let pool = ThreadPoolWorkQueue::new(2);
        pool.shutdown();
        pool.shutdown();
        let rejected = pool.queue_work_item(Box::new(|| panic!("must not run")));
        assert!(matches!(rejected, Err(Error::Disposed)));
        assert_eq!(pool.count(), 0);
    }
}
