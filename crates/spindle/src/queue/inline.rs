//! Single-threaded queue driven by the caller

use crate::error::{Error, Result};
use crate::future::CompletionSignal;
use crate::queue::{WorkItem, WorkQueue};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a cooperative wait blocks before re-checking its signal
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Work queue whose items run on the thread that calls `step`
///
/// Waiting on a future drains queued items on the waiting thread, so a
/// single-threaded game or simulation loop can block on a task without
/// starving the work that task depends on.
#[derive(Default)]
pub struct InlineWorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    closed: AtomicBool,
}

impl InlineWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest queued item. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        let item = self.items.lock().pop_front();
        match item {
            Some(item) => {
                item();
                true
            }
            None => false,
        }
    }
}

impl WorkQueue for InlineWorkQueue {
    fn queue_work_item(&self, item: WorkItem) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            log::warn!("Work item queued after shutdown; dropping it");
            drop(item);
            return Err(Error::Disposed);
        }
        self.items.lock().push_back(item);
        self.available.notify_all();
        Ok(())
    }

    fn step(&self) {
        // Items queued by this step's items wait for the next step.
        let batch = self.items.lock().len();
        for _ in 0..batch {
            if !self.run_one() {
                break;
            }
        }
    }

    fn wait_for_work_items(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.available.wait_for(&mut items, timeout);
        }
        !items.is_empty()
    }

    fn wait_for_signal(&self, signal: &CompletionSignal) {
        while !signal.is_set() {
            if !self.run_one() {
                self.wait_for_work_items(WAIT_SLICE);
            }
        }
    }

    fn count(&self) -> usize {
        self.items.lock().len()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = std::mem::take(&mut *self.items.lock());
        if !dropped.is_empty() {
            log::debug!("Inline queue shut down with {} pending items", dropped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::TaskFuture;
    use std::sync::Arc;

    #[test]
    fn test_step_runs_in_fifo_order() {
        let queue = InlineWorkQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            queue.queue_work_item(Box::new(move || log.lock().push(i))).unwrap();
        }
        assert_eq!(queue.count(), 3);
        queue.step();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_items_queued_during_step_wait_for_next_step() {
        let queue = Arc::new(InlineWorkQueue::new());
        let ran = Arc::new(Mutex::new(0));
        let q = queue.clone();
        let r = ran.clone();
        queue.queue_work_item(Box::new(move || {
            *r.lock() += 1;
            let r2 = r.clone();
            q.queue_work_item(Box::new(move || *r2.lock() += 10)).unwrap();
        }))
        .unwrap();

        queue.step();
        assert_eq!(*ran.lock(), 1);
        queue.step();
        assert_eq!(*ran.lock(), 11);
    }

    #[test]
    fn test_wait_for_work_items_timeout() {
        let queue = InlineWorkQueue::new();
        assert!(!queue.wait_for_work_items(Duration::from_millis(5)));
        queue.queue_work_item(Box::new(|| {})).unwrap();
        assert!(queue.wait_for_work_items(Duration::from_millis(5)));
    }

    #[test]
    fn test_wait_for_signal_drains_queue() {
        let queue = InlineWorkQueue::new();
        let future = TaskFuture::new();
        let producer = future.clone();
        queue.queue_work_item(Box::new(move || producer.complete(5))).unwrap();

        queue.wait_for_signal(future.signal());
        assert_eq!(future.result().unwrap(), 5);
    }

    #[test]
    fn test_shutdown_drops_pending_and_rejects_new() {
        let queue = InlineWorkQueue::new();
        queue.queue_work_item(Box::new(|| panic!("must not run"))).unwrap();
        queue.shutdown();
        assert_eq!(queue.count(), 0);
        let rejected = queue.queue_work_item(Box::new(|| panic!("must not run")));
        assert!(matches!(rejected, Err(Error::Disposed)));
        queue.step();
        queue.shutdown();
    }
}
