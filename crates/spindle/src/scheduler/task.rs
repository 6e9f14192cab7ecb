//! Task identity and the schedulable contract

use crate::error::{Error, Result};
use crate::future::TaskFuture;
use crate::scheduler::SchedulerHandle;
use parking_lot::Mutex;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Unique identifier for a started task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the scheduler treats a task's failure
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Errors reach only whoever awaits the returned future
    #[default]
    RunWhileFutureLives,
    /// Errors also go through the scheduler's error handler, and are raised
    /// fatally on the work queue if nothing suppresses them
    Background,
}

/// Anything the scheduler can start
///
/// `schedule` is called exactly once with a fresh pending future. The
/// implementation owns that future from then on and must complete it exactly
/// once, from whichever thread finishes the work.
pub trait Schedulable: Send + 'static {
    type Output: Clone + Send + 'static;

    fn schedule(self, scheduler: &SchedulerHandle, task: TaskId, future: TaskFuture<Self::Output>);
}

/// Primitive callback-based task
///
/// The callback receives the future and completes it itself, immediately or
/// later from a continuation.
pub struct FnTask<T, F> {
    body: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> FnTask<T, F>
where
    T: Clone + Send + 'static,
    F: FnOnce(&SchedulerHandle, TaskFuture<T>) + Send + 'static,
{
    pub fn new(body: F) -> Self {
        Self {
            body,
            _output: PhantomData,
        }
    }
}

impl<T, F> Schedulable for FnTask<T, F>
where
    T: Clone + Send + 'static,
    F: FnOnce(&SchedulerHandle, TaskFuture<T>) + Send + 'static,
{
    type Output = T;

    fn schedule(self, scheduler: &SchedulerHandle, _task: TaskId, future: TaskFuture<T>) {
        (self.body)(scheduler, future);
    }
}

/// Task whose body is a native `async` block
///
/// The body is polled on the scheduler's work queue; each wake queues one
/// more poll.
pub struct AsyncTask<T, Fut> {
    body: Fut,
    _output: PhantomData<fn() -> T>,
}

impl<T, Fut> AsyncTask<T, Fut>
where
    T: Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    pub fn new(body: Fut) -> Self {
        Self {
            body,
            _output: PhantomData,
        }
    }
}

impl<T, Fut> Schedulable for AsyncTask<T, Fut>
where
    T: Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    type Output = T;

    fn schedule(self, scheduler: &SchedulerHandle, task: TaskId, future: TaskFuture<T>) {
        let body: BoxedBody<T> = Box::pin(self.body);
        let driver = Arc::new(AsyncDriver {
            task,
            body: Mutex::new(Some(body)),
            abandoned: AtomicBool::new(false),
            future,
            scheduler: scheduler.clone(),
        });
        driver.queue_poll();
    }
}

type BoxedBody<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

struct AsyncDriver<T> {
    task: TaskId,
    /// `None` once finished; whoever takes the body settles the future
    body: Mutex<Option<BoxedBody<T>>>,
    abandoned: AtomicBool,
    future: TaskFuture<T>,
    scheduler: SchedulerHandle,
}

impl<T: Clone + Send + 'static> AsyncDriver<T> {
    fn queue_poll(self: Arc<Self>) {
        let scheduler = self.scheduler.clone();
        let task = self.task;
        let poll = QueuedPoll {
            driver: Some(self),
        };
        if let Err(e) = scheduler.queue_work_item(move || poll.run()) {
            log::debug!("Async task {:?} could not be polled: {}", task, e);
        }
    }

    /// The work queue dropped a poll without running it.
    ///
    /// If a poll is in progress (possibly on this very thread, when the body
    /// woke itself) that poll fails the task instead of returning pending.
    fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        let Some(mut slot) = self.body.try_lock() else {
            return;
        };
        if slot.take().is_some() {
            drop(slot);
            log::debug!("Async task {:?} abandoned by its work queue", self.task);
            settle_task(self.task, &self.future, Err(Error::Disposed));
        }
    }

    fn poll_once(self: Arc<Self>) {
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let outcome = {
            let mut slot = self.body.lock();
            let Some(body) = slot.as_mut() else {
                // Late wake after completion
                return;
            };
            let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
            match polled {
                Ok(Poll::Pending) if !self.abandoned.load(Ordering::Acquire) => None,
                Ok(Poll::Pending) => {
                    *slot = None;
                    Some(Err(Error::Disposed))
                }
                Ok(Poll::Ready(result)) => {
                    *slot = None;
                    Some(result)
                }
                Err(payload) => {
                    *slot = None;
                    Some(Err(Error::from_panic(payload.as_ref())))
                }
            }
        };

        let Some(outcome) = outcome else {
            // An abandon that raced with this poll could not take the lock
            if self.abandoned.load(Ordering::Acquire) {
                self.abandon();
            }
            return;
        };

        log::debug!("Async task {:?} finished (ok: {})", self.task, outcome.is_ok());
        settle_task(self.task, &self.future, outcome);
    }
}

/// One queued poll. Dropping it unrun fails the task with `Error::Disposed`,
/// so a shut-down work queue cannot strand the task's future.
struct QueuedPoll<T: Clone + Send + 'static> {
    driver: Option<Arc<AsyncDriver<T>>>,
}

impl<T: Clone + Send + 'static> QueuedPoll<T> {
    fn run(mut self) {
        if let Some(driver) = self.driver.take() {
            driver.poll_once();
        }
    }
}

impl<T: Clone + Send + 'static> Drop for QueuedPoll<T> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abandon();
        }
    }
}

impl<T: Clone + Send + 'static> Wake for AsyncDriver<T> {
    fn wake(self: Arc<Self>) {
        self.queue_poll();
    }
}

/// Complete a task's own future. A task's future completing twice means
/// something other than its driver settled it, which is a scheduler bug.
pub(crate) fn settle_task<T: Clone + Send + 'static>(
    task: TaskId,
    future: &TaskFuture<T>,
    result: Result<T>,
) {
    if future.settle(result).is_err() {
        log::error!("Task {:?} completed its future twice", task);
        panic!("task {:?} completed its future twice", task);
    }
}
