//! Coroutine-backed tasks
//!
//! A coroutine is a resumable task body written as an explicit state machine.
//! Each call to `resume` runs it up to its next suspension point and returns a
//! `Step` describing what it is waiting for. The driver interprets the step,
//! registers a continuation on whatever was awaited, and resumes the body with
//! the awaited value (or error) once it is available, on whichever thread
//! delivered it.
//!
//! Driver steps never nest on one thread's stack: a step triggered while
//! another is running (a child's first resume, or a parent woken by its child
//! finishing) is queued and run by the outer step's loop.

use crate::error::{Error, Result};
use crate::future::TaskFuture;
use crate::scheduler::task::{settle_task, ExecutionPolicy, Schedulable, TaskId};
use crate::scheduler::SchedulerHandle;
use parking_lot::Mutex;
use std::any::{self, Any};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Input handed to a coroutine when it is resumed
pub enum Resume {
    /// First resume; nothing has been awaited yet
    Start,
    /// The awaited future or child task completed with this value
    Ready(Box<dyn Any + Send>),
    /// The awaited future or child task failed
    Failed(Error),
}

impl Resume {
    /// Extract the awaited value, or the error the awaited work failed with.
    pub fn take<T: Any>(self) -> Result<T> {
        match self {
            Resume::Ready(value) => value
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| Error::TypeMismatch {
                    expected: any::type_name::<T>(),
                }),
            Resume::Failed(error) => Err(error),
            Resume::Start => Err(Error::msg("resumed without an awaited value")),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Resume::Start)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Resume::Failed(_))
    }
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resume::Start => f.write_str("Start"),
            Resume::Ready(_) => f.write_str("Ready(..)"),
            Resume::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

type ResumeFn = Box<dyn FnOnce(Resume) + Send>;

/// Type-erased handle on a `TaskFuture<U>` of any `U`
pub struct Awaited {
    register: Box<dyn FnOnce(ResumeFn) + Send>,
}

impl Awaited {
    fn register(self, resume: ResumeFn) {
        (self.register)(resume)
    }
}

impl<T: Clone + Send + 'static> From<TaskFuture<T>> for Awaited {
    fn from(future: TaskFuture<T>) -> Self {
        Awaited {
            register: Box::new(move |resume: ResumeFn| {
                future.on_complete(move |_, result| {
                    resume(match result {
                        Ok(value) => Resume::Ready(Box::new(value.clone())),
                        Err(error) => Resume::Failed(error.clone()),
                    })
                });
            }),
        }
    }
}

/// A nested coroutine waiting to be started as a child of the current task
pub struct ChildTask {
    start: Box<dyn FnOnce(&SchedulerHandle) -> Awaited + Send>,
}

impl ChildTask {
    pub fn new<C: Coroutine>(child: C) -> Self {
        ChildTask {
            start: Box::new(move |scheduler: &SchedulerHandle| -> Awaited {
                scheduler
                    .start(CoroutineTask::new(child), ExecutionPolicy::default())
                    .into()
            }),
        }
    }

    fn start(self, scheduler: &SchedulerHandle) -> Awaited {
        (self.start)(scheduler)
    }
}

/// What a coroutine produced at a suspension point
pub enum Step<T> {
    /// Suspend until the future completes
    Await(Awaited),
    /// Start a nested coroutine and suspend until it completes
    Spawn(ChildTask),
    /// Finished; the payload completes the task's future
    Return(T),
    /// Finished with an error
    Fault(Error),
    /// A bare value that is not a suspension. Not resumable.
    Raw(Box<dyn Any + Send>),
    /// The body ran off its end without returning a result
    Done,
}

impl<T> Step<T> {
    /// Suspend on a clone of `future`
    pub fn await_future<U: Clone + Send + 'static>(future: &TaskFuture<U>) -> Self {
        Step::Await(future.clone().into())
    }

    pub fn spawn<C: Coroutine>(child: C) -> Self {
        Step::Spawn(ChildTask::new(child))
    }

    pub fn raw<V: Any + Send>(value: V) -> Self {
        Step::Raw(Box::new(value))
    }
}

/// A resumable task body
pub trait Coroutine: Send + 'static {
    type Output: Clone + Send + 'static;

    /// Run until the next suspension point.
    fn resume(&mut self, input: Resume) -> Step<Self::Output>;

    /// Name used in diagnostics
    fn name(&self) -> &'static str {
        any::type_name::<Self>()
    }
}

/// Coroutine built from a closure; see [`coroutine`]
pub struct FnCoroutine<T, F> {
    body: F,
    _output: PhantomData<fn() -> T>,
}

/// Build a coroutine from a closure that is called once per resume.
///
/// The closure keeps its own state between calls. Returning `Err` fails the
/// task, so `?` on `Resume::take` propagates an awaited failure.
pub fn coroutine<T, F>(body: F) -> FnCoroutine<T, F>
where
    T: Clone + Send + 'static,
    F: FnMut(Resume) -> Result<Step<T>> + Send + 'static,
{
    FnCoroutine {
        body,
        _output: PhantomData,
    }
}

impl<T, F> Coroutine for FnCoroutine<T, F>
where
    T: Clone + Send + 'static,
    F: FnMut(Resume) -> Result<Step<T>> + Send + 'static,
{
    type Output = T;

    fn resume(&mut self, input: Resume) -> Step<T> {
        (self.body)(input).unwrap_or_else(Step::Fault)
    }

    fn name(&self) -> &'static str {
        any::type_name::<F>()
    }
}

/// Schedulable wrapper that drives a coroutine to completion
pub struct CoroutineTask<C> {
    body: C,
}

impl<C: Coroutine> CoroutineTask<C> {
    pub fn new(body: C) -> Self {
        Self { body }
    }
}

impl<C: Coroutine> Schedulable for CoroutineTask<C> {
    type Output = C::Output;

    fn schedule(self, scheduler: &SchedulerHandle, task: TaskId, future: TaskFuture<C::Output>) {
        let driver = Arc::new(Driver {
            task,
            name: self.body.name(),
            body: Mutex::new(Some(self.body)),
            future,
            scheduler: scheduler.clone(),
        });
        driver.advance(Resume::Start);
    }
}

struct Driver<C: Coroutine> {
    task: TaskId,
    name: &'static str,
    /// `None` once the coroutine has finished
    body: Mutex<Option<C>>,
    future: TaskFuture<C::Output>,
    scheduler: SchedulerHandle,
}

enum Handoff {
    /// The driver is still registering its continuation
    Registering,
    /// The awaited work completed during registration
    Ready(Resume),
    /// The driver returned; the continuation resumes the body itself
    Parked,
}

type DriverJob = Box<dyn FnOnce()>;

thread_local! {
    /// Set while this thread is inside a driver step
    static DRIVING: Cell<bool> = const { Cell::new(false) };
    /// Driver steps deferred by nested starts and resumes on this thread
    static DEFERRED: RefCell<VecDeque<DriverJob>> = const { RefCell::new(VecDeque::new()) };
}

struct DrivingGuard;

impl Drop for DrivingGuard {
    fn drop(&mut self) {
        DRIVING.with(|driving| driving.set(false));
    }
}

/// Run `job` now, or queue it behind the driver step already running on this
/// thread.
///
/// A child started by its parent, or a parent resumed by its finishing child,
/// would otherwise nest one driver step inside another. Queueing keeps stack
/// depth flat however deep the task tree is, and the job still runs on the
/// thread that triggered it.
fn run_driver_step<F: FnOnce() + 'static>(job: F) {
    if DRIVING.with(|driving| driving.replace(true)) {
        DEFERRED.with(|queue| queue.borrow_mut().push_back(Box::new(job)));
        return;
    }
    let _guard = DrivingGuard;

    let mut first_panic = panic::catch_unwind(AssertUnwindSafe(job)).err();
    while let Some(next) = DEFERRED.with(|queue| queue.borrow_mut().pop_front()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(next)) {
            first_panic.get_or_insert(payload);
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

impl<C: Coroutine> Driver<C> {
    fn advance(self: Arc<Self>, input: Resume) {
        run_driver_step(move || self.run(input));
    }

    /// Resume the body until it suspends on incomplete work or finishes
    fn run(self: Arc<Self>, mut input: Resume) {
        loop {
            let step = {
                let mut slot = self.body.lock();
                let Some(body) = slot.as_mut() else {
                    return;
                };
                match panic::catch_unwind(AssertUnwindSafe(|| body.resume(input))) {
                    Ok(step) => step,
                    Err(payload) => Step::Fault(Error::from_panic(payload.as_ref())),
                }
            };

            let awaited = match step {
                Step::Await(awaited) => awaited,
                Step::Spawn(child) => child.start(&self.scheduler),
                Step::Return(value) => return self.finish(Ok(value)),
                Step::Fault(error) => return self.finish(Err(error)),
                Step::Raw(_) => {
                    let error = self.violation("yielded a value that is not a suspension");
                    return self.finish(Err(error));
                }
                Step::Done => {
                    let error = self.violation("finished without returning a result");
                    return self.finish(Err(error));
                }
            };

            match Arc::clone(&self).suspend_on(awaited) {
                Some(resume) => input = resume,
                None => return,
            }
        }
    }

    /// Register the continuation that resumes the body. If the awaited work
    /// is already complete the resume value is handed back to the caller's
    /// loop instead of recursing.
    fn suspend_on(self: Arc<Self>, awaited: Awaited) -> Option<Resume> {
        let handoff = Arc::new(Mutex::new(Handoff::Registering));
        let slot = Arc::clone(&handoff);
        let driver = Arc::clone(&self);

        awaited.register(Box::new(move |resume| {
            let mut state = slot.lock();
            if let Handoff::Registering = *state {
                *state = Handoff::Ready(resume);
                return;
            }
            drop(state);
            driver.advance(resume);
        }));

        let mut state = handoff.lock();
        match std::mem::replace(&mut *state, Handoff::Parked) {
            Handoff::Ready(resume) => Some(resume),
            Handoff::Registering | Handoff::Parked => None,
        }
    }

    fn violation(&self, detail: &str) -> Error {
        Error::ProtocolViolation {
            task: self.task,
            name: self.name.to_string(),
            detail: detail.to_string(),
        }
    }

    fn finish(&self, result: Result<C::Output>) {
        // Drop the body before completing so resources it holds are released
        // by the time awaiters run.
        self.body.lock().take();
        match &result {
            Ok(_) => log::debug!("Coroutine task {:?} ({}) completed", self.task, self.name),
            Err(e) => log::debug!("Coroutine task {:?} ({}) failed: {}", self.task, self.name, e),
        }
        settle_task(self.task, &self.future, result);
    }
}
