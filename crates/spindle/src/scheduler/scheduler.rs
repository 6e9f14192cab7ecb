//! Scheduler facade owning the work queue and the sleep thread

use crate::error::{Error, Result};
use crate::future::TaskFuture;
use crate::queue::{WorkItem, WorkQueue, WorkQueueFactory};
use crate::scheduler::{
    AsyncTask, Coroutine, CoroutineTask, ExecutionPolicy, Schedulable, SleepWorker, TaskId, Ticker,
};
use crate::time::{ticks_from_duration, MonotonicTime, TimeSource};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Decides whether a background task's error is handled.
///
/// Returning true suppresses the error; returning false lets it be raised as
/// a fatal `Error::UnhandledBackground` panic on the work queue.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Scheduler construction options
#[derive(Clone, Default)]
pub struct SchedulerConfig {
    /// How to build the work queue
    pub work_queue: WorkQueueFactory,

    /// Tick source for sleeps (None = wall clock)
    pub time_source: Option<Arc<dyn TimeSource>>,

    /// Background error handler installed at construction
    pub error_handler: Option<ErrorHandler>,
}

impl SchedulerConfig {
    /// Work runs on the thread calling `step`
    pub fn inline() -> Self {
        Self {
            work_queue: WorkQueueFactory::Inline,
            ..Self::default()
        }
    }

    /// Work runs on `workers` pool threads (0 = one per CPU)
    pub fn thread_pool(workers: usize) -> Self {
        Self {
            work_queue: WorkQueueFactory::ThreadPool { workers },
            ..Self::default()
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time);
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("work_queue", &self.work_queue)
            .field("time_source", &self.time_source.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Total tasks started
    pub tasks_started: u64,

    /// Tasks whose future completed with a value
    pub tasks_completed: u64,

    /// Tasks whose future completed with an error
    pub tasks_failed: u64,

    /// Background errors an error handler suppressed
    pub background_errors_handled: u64,

    /// Background errors raised as fatal
    pub background_errors_raised: u64,

    /// Sleeps waiting on the sleep thread
    pub pending_sleeps: usize,

    /// Advisory work queue depth
    pub queued_work: usize,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    handled: AtomicU64,
    raised: AtomicU64,
}

struct Shared {
    work_queue: Box<dyn WorkQueue>,
    sleeper: SleepWorker,
    time: Arc<dyn TimeSource>,
    step_listeners: Mutex<VecDeque<WorkItem>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    disposed: AtomicBool,
    counters: Counters,
}

impl Shared {
    /// Runs on the work queue after a background task failed
    fn handle_background_error(&self, task: TaskId, error: Error) {
        let handler = self.error_handler.read().clone();
        if let Some(handler) = handler {
            if handler(&error) {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                log::debug!("Background task {:?} error handled: {}", task, error);
                return;
            }
        }

        self.counters.raised.fetch_add(1, Ordering::Relaxed);
        log::error!("Unhandled error in background task {:?}: {}", task, error);
        std::panic::panic_any(Error::UnhandledBackground {
            task,
            source: Box::new(error),
        });
    }
}

/// Cloneable reference to a scheduler
///
/// Task bodies and continuations hold handles; the owning [`Scheduler`]
/// disposes the shared state when dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Start a task and return its future without blocking.
    pub fn start<S: Schedulable>(&self, task: S, policy: ExecutionPolicy) -> TaskFuture<S::Output> {
        if self.is_disposed() {
            return TaskFuture::failed(Error::Disposed);
        }

        let id = TaskId::new();
        let future = TaskFuture::new();
        self.shared.counters.started.fetch_add(1, Ordering::Relaxed);
        log::debug!("Starting task {:?} ({:?})", id, policy);

        // Bookkeeping continuations go first so they run before any waiter
        // blocked on the future is released.
        let weak = Arc::downgrade(&self.shared);
        future.on_complete(move |_, result| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let counter = match result {
                Ok(_) => &shared.counters.completed,
                Err(_) => &shared.counters.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });

        if policy == ExecutionPolicy::Background {
            let weak = Arc::downgrade(&self.shared);
            future.on_complete(move |_, result| {
                let Err(error) = result else {
                    return;
                };
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let error = error.clone();
                let item_shared: Weak<Shared> = Arc::downgrade(&shared);
                let queued = shared.work_queue.queue_work_item(Box::new(move || {
                    if let Some(shared) = item_shared.upgrade() {
                        shared.handle_background_error(id, error);
                    }
                }));
                if queued.is_err() {
                    log::warn!(
                        "Background task {:?} failed after the scheduler was disposed",
                        id
                    );
                }
            });
        }

        task.schedule(self, id, future.clone());
        future
    }

    /// Start a coroutine whose errors reach only its awaiters
    pub fn spawn<C: Coroutine>(&self, body: C) -> TaskFuture<C::Output> {
        self.start(CoroutineTask::new(body), ExecutionPolicy::RunWhileFutureLives)
    }

    /// Start a coroutine under the background error policy
    pub fn spawn_background<C: Coroutine>(&self, body: C) -> TaskFuture<C::Output> {
        self.start(CoroutineTask::new(body), ExecutionPolicy::Background)
    }

    /// Start a native `async` body polled on the work queue
    pub fn start_async<T, Fut>(&self, body: Fut) -> TaskFuture<T>
    where
        T: Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        self.start(AsyncTask::new(body), ExecutionPolicy::RunWhileFutureLives)
    }

    /// Queue a callback on the work queue. Fails with `Error::Disposed` once
    /// the scheduler has been disposed.
    pub fn queue_work_item<F>(&self, item: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.work_queue.queue_work_item(Box::new(item))
    }

    /// Run `listener` once, at the start of the next `step`
    pub fn add_step_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.step_listeners.lock().push_back(Box::new(listener));
    }

    /// Drain step listeners registered before this call, in order, then step
    /// the work queue.
    pub fn step(&self) {
        let listeners = std::mem::take(&mut *self.shared.step_listeners.lock());
        for listener in listeners {
            listener();
        }
        self.shared.work_queue.step();
    }

    /// Block until `future` completes, letting the work queue make progress.
    pub fn wait_for<T: Clone + Send + 'static>(&self, future: &TaskFuture<T>) -> Result<T> {
        self.shared.work_queue.wait_for_signal(future.signal());
        future.result()
    }

    /// Start `body` and block until it completes
    pub fn wait_for_task<C: Coroutine>(&self, body: C) -> Result<C::Output> {
        let future = self.spawn(body);
        self.wait_for(&future)
    }

    /// Whether step listeners or queued work remain. Advisory.
    pub fn has_pending_tasks(&self) -> bool {
        !self.shared.step_listeners.lock().is_empty() || self.shared.work_queue.count() > 0
    }

    /// Complete `future` once the time source reaches `wake_at` ticks
    pub fn queue_sleep(&self, wake_at: u64, future: TaskFuture<()>) {
        self.shared.sleeper.queue_sleep(wake_at, future);
    }

    /// Future completing after `duration`
    pub fn sleep(&self, duration: Duration) -> TaskFuture<()> {
        let wake_at = self.shared.time.now().saturating_add(ticks_from_duration(duration));
        self.sleep_until(wake_at)
    }

    /// Future completing at `wake_at` ticks
    pub fn sleep_until(&self, wake_at: u64) -> TaskFuture<()> {
        let future = TaskFuture::new();
        self.queue_sleep(wake_at, future.clone());
        future
    }

    /// Wake the sleep thread after a manual time source jumped forward
    pub fn nudge_sleeper(&self) {
        self.shared.sleeper.nudge();
    }

    /// Periodic clock ticking every `interval`
    pub fn create_clock(&self, interval: Duration) -> Ticker {
        Ticker::new(self.clone(), interval)
    }

    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.shared.time
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        *self.shared.error_handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_error_handler(&self) {
        *self.shared.error_handler.write() = None;
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        SchedulerStats {
            tasks_started: counters.started.load(Ordering::Relaxed),
            tasks_completed: counters.completed.load(Ordering::Relaxed),
            tasks_failed: counters.failed.load(Ordering::Relaxed),
            background_errors_handled: counters.handled.load(Ordering::Relaxed),
            background_errors_raised: counters.raised.load(Ordering::Relaxed),
            pending_sleeps: self.shared.sleeper.pending_count(),
            queued_work: self.shared.work_queue.count(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Release the work queue and the sleep thread.
    ///
    /// Safe to call more than once; must not race with active scheduling.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Disposing scheduler");
        self.shared.step_listeners.lock().clear();
        self.shared.work_queue.shutdown();
        self.shared.sleeper.stop();
    }
}

/// Owning scheduler; disposes on drop
pub struct Scheduler {
    handle: SchedulerHandle,
}

impl Scheduler {
    /// Scheduler with a thread pool sized to the CPU count
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Scheduler whose work runs on the thread calling `step`
    pub fn inline() -> Self {
        Self::with_config(SchedulerConfig::inline())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let work_queue = config.work_queue.build();
        Self::build(work_queue, config.time_source, config.error_handler)
    }

    /// Scheduler around an already constructed work queue
    pub fn with_work_queue(work_queue: Box<dyn WorkQueue>) -> Self {
        Self::build(work_queue, None, None)
    }

    fn build(
        work_queue: Box<dyn WorkQueue>,
        time: Option<Arc<dyn TimeSource>>,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        let time = time.unwrap_or_else(|| Arc::new(MonotonicTime::new()));
        let sleeper = SleepWorker::start(Arc::clone(&time));

        Self {
            handle: SchedulerHandle {
                shared: Arc::new(Shared {
                    work_queue,
                    sleeper,
                    time,
                    step_listeners: Mutex::new(VecDeque::new()),
                    error_handler: RwLock::new(error_handler),
                    disposed: AtomicBool::new(false),
                    counters: Counters::default(),
                }),
            },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &SchedulerHandle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}
