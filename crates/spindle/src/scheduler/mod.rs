//! Task Scheduler
//!
//! The scheduler starts schedulable tasks, owns the work queue that runs their
//! callbacks and the dedicated thread that services timed sleeps, and routes
//! background task failures to a configurable error handler.

mod coroutine;
#[allow(clippy::module_inception)]
mod scheduler;
mod sleep;
mod task;
mod ticker;

pub use coroutine::{
    coroutine, Awaited, ChildTask, Coroutine, CoroutineTask, FnCoroutine, Resume, Step,
};
pub use scheduler::{ErrorHandler, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
pub use sleep::{SleepWorker, MAX_WAIT, MIN_SLEEP, SPIN_THRESHOLD, WAKE_FUDGE};
pub use task::{AsyncTask, ExecutionPolicy, FnTask, Schedulable, TaskId};
pub use ticker::Ticker;
