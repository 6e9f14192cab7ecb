//! Work queues
//!
//! A work queue executes the callbacks the scheduler hands it. `InlineWorkQueue`
//! runs them on whichever thread calls `step()`; `ThreadPoolWorkQueue` runs them
//! on its own worker threads.

mod inline;
mod pool;

pub use inline::InlineWorkQueue;
pub use pool::ThreadPoolWorkQueue;

use crate::error::Result;
use crate::future::CompletionSignal;
use std::sync::Arc;
use std::time::Duration;

/// A queued callback
pub type WorkItem = Box<dyn FnOnce() + Send>;

/// Executes queued callbacks
pub trait WorkQueue: Send + Sync {
    /// Enqueue a callback for eventual execution.
    ///
    /// After `shutdown` the item is dropped unrun and `Error::Disposed` is
    /// returned.
    fn queue_work_item(&self, item: WorkItem) -> Result<()>;

    /// Execute currently queued items according to this queue's discipline.
    ///
    /// Re-raises panics from work items that ran since the previous step.
    fn step(&self);

    /// Block until at least one item is queued or `timeout` elapses.
    fn wait_for_work_items(&self, timeout: Duration) -> bool;

    /// Block until `signal` is set, letting queued work make progress meanwhile.
    fn wait_for_signal(&self, signal: &CompletionSignal);

    /// Advisory number of queued or running items
    fn count(&self) -> usize;

    /// Stop accepting work and release owned threads. Idempotent.
    fn shutdown(&self);
}

/// How the scheduler builds its work queue
#[derive(Clone)]
pub enum WorkQueueFactory {
    /// Run work on the thread calling `Scheduler::step`
    Inline,
    /// Run work on a pool of this many threads (0 = one per CPU)
    ThreadPool { workers: usize },
    /// Caller-supplied queue
    Custom(Arc<dyn Fn() -> Box<dyn WorkQueue> + Send + Sync>),
}

impl WorkQueueFactory {
    pub fn build(&self) -> Box<dyn WorkQueue> {
        match self {
            WorkQueueFactory::Inline => Box::new(InlineWorkQueue::new()),
            WorkQueueFactory::ThreadPool { workers } => {
                let count = if *workers == 0 { num_cpus::get() } else { *workers };
                Box::new(ThreadPoolWorkQueue::new(count))
            }
            WorkQueueFactory::Custom(factory) => factory(),
        }
    }
}

impl Default for WorkQueueFactory {
    fn default() -> Self {
        WorkQueueFactory::ThreadPool { workers: 0 }
    }
}

impl std::fmt::Debug for WorkQueueFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkQueueFactory::Inline => f.write_str("Inline"),
            WorkQueueFactory::ThreadPool { workers } => f
                .debug_struct("ThreadPool")
                .field("workers", workers)
                .finish(),
            WorkQueueFactory::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_inline() {
        let queue = WorkQueueFactory::Inline.build();
        assert_eq!(queue.count(), 0);
        queue.shutdown();
    }

    #[test]
    fn test_factory_custom() {
        let factory = WorkQueueFactory::Custom(Arc::new(|| {
            Box::new(InlineWorkQueue::new()) as Box<dyn WorkQueue>
        }));
        let queue = factory.build();
        queue.queue_work_item(Box::new(|| {})).unwrap();
        assert_eq!(queue.count(), 1);
        queue.shutdown();
    }

    #[test]
    fn test_factory_default_is_pool() {
        assert!(matches!(
            WorkQueueFactory::default(),
            WorkQueueFactory::ThreadPool { workers: 0 }
        ));
    }
}
