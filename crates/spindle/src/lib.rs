//! Spindle
//!
//! Cooperative task scheduling without a thread per task. Long-running logic is
//! written as coroutines (or `async` blocks) that suspend on futures, child
//! tasks and timed sleeps; the scheduler resumes them when what they wait on
//! completes.
//!
//! ```ignore
//! use spindle::{coroutine, Scheduler, Step};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new();
//! let handle = scheduler.handle();
//! let mut state = 0;
//! let answer = scheduler.wait_for_task(coroutine(move |resume| {
//!     state += 1;
//!     match state {
//!         1 => Ok(Step::await_future(&handle.sleep(Duration::from_millis(5)))),
//!         _ => {
//!             resume.take::<()>()?;
//!             Ok(Step::Return(42))
//!         }
//!     }
//! }));
//! assert_eq!(answer.unwrap(), 42);
//! ```

pub mod error;
pub mod future;
pub mod queue;
pub mod scheduler;
pub mod time;

pub use error::{Error, Result};
pub use future::{CompletionSignal, ContinuationToken, TaskFuture};
pub use queue::{InlineWorkQueue, ThreadPoolWorkQueue, WorkItem, WorkQueue, WorkQueueFactory};
pub use scheduler::{
    coroutine, AsyncTask, Coroutine, CoroutineTask, ErrorHandler, ExecutionPolicy, FnTask, Resume,
    Schedulable, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, Step, TaskId, Ticker,
};
pub use time::{ManualTime, MonotonicTime, TimeSource, TICKS_PER_MILLISECOND, TICKS_PER_SECOND};
