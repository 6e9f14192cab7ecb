//! Single-assignment completion cell with continuations
//!
//! A `TaskFuture` is shared between the task that produces its result and any
//! number of awaiters. It completes exactly once; continuations registered
//! before completion fire in registration order when it completes, and
//! continuations registered afterwards fire immediately on the registering
//! thread.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Callback invoked once the future completes
pub type Continuation<T> = Box<dyn FnOnce(&TaskFuture<T>, &Result<T>) + Send>;

/// Identifies a registered continuation so it can be removed again
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(u64);

/// Type-erased "has completed" flag that work queues can block on
#[derive(Debug, Default)]
pub struct CompletionSignal {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }

    /// Whether the owning future has completed
    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }

    /// Block until the owning future completes
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }

    /// Block until completion or timeout. Returns whether the future completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.condvar.wait_for(&mut done, timeout);
        }
        *done
    }
}

enum State<T> {
    Pending {
        continuations: Vec<(ContinuationToken, Continuation<T>)>,
        wakers: Vec<Waker>,
    },
    Completed(Result<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    signal: Arc<CompletionSignal>,
    next_token: AtomicU64,
}

/// Eventual result of a scheduled task
pub struct TaskFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
    /// Create a pending future
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    continuations: Vec::new(),
                    wakers: Vec::new(),
                }),
                signal: Arc::new(CompletionSignal::new()),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Create a future that already holds `value`
    pub fn completed(value: T) -> Self {
        let future = Self::new();
        future.complete(value);
        future
    }

    /// Create a future that already failed with `error`
    pub fn failed(error: Error) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    /// Complete with a value.
    ///
    /// # Panics
    ///
    /// Panics if the future was already completed. A second completion means
    /// two producers believe they own this future.
    pub fn complete(&self, value: T) {
        if self.settle(Ok(value)).is_err() {
            panic!("TaskFuture completed twice");
        }
    }

    /// Complete with an error.
    ///
    /// # Panics
    ///
    /// Panics if the future was already completed.
    pub fn fail(&self, error: Error) {
        if self.settle(Err(error)).is_err() {
            panic!("TaskFuture completed twice");
        }
    }

    /// Complete with a value, reporting a second completion as an error
    pub fn try_complete(&self, value: T) -> Result<()> {
        self.settle(Ok(value))
    }

    /// Complete with an error, reporting a second completion as an error
    pub fn try_fail(&self, error: Error) -> Result<()> {
        self.settle(Err(error))
    }

    /// Store `result` and fire every registered continuation.
    ///
    /// Returns `Err(Error::AlreadyCompleted)` without touching the stored
    /// result if the future already completed.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic from a continuation, after the remaining
    /// continuations have run and blocked waiters have been released.
    pub fn settle(&self, result: Result<T>) -> Result<()> {
        let (continuations, wakers) = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Completed(_) => return Err(Error::AlreadyCompleted),
                State::Pending {
                    continuations,
                    wakers,
                } => {
                    let taken = (std::mem::take(continuations), std::mem::take(wakers));
                    *state = State::Completed(result.clone());
                    taken
                }
            }
        };

        // Continuations run outside the lock so they may register on this
        // future or complete others without deadlocking. A panicking
        // continuation must not starve the rest, so the first panic is held
        // until every continuation, waker and waiter has been released.
        let mut first_panic = None;
        for (_, continuation) in continuations {
            let ran = panic::catch_unwind(AssertUnwindSafe(|| continuation(self, &result)));
            if let Err(payload) = ran {
                first_panic.get_or_insert(payload);
            }
        }
        for waker in wakers {
            waker.wake();
        }

        // Blocking waiters return only after every continuation has run.
        self.inner.signal.set();

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    /// Register a continuation.
    ///
    /// Fires immediately on the calling thread if the future has already
    /// completed.
    pub fn on_complete<F>(&self, continuation: F) -> ContinuationToken
    where
        F: FnOnce(&TaskFuture<T>, &Result<T>) + Send + 'static,
    {
        let token = ContinuationToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));

        let completed = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { continuations, .. } => {
                    continuations.push((token, Box::new(continuation)));
                    return token;
                }
                State::Completed(result) => result.clone(),
            }
        };

        continuation(self, &completed);
        token
    }

    /// Unregister a continuation that has not fired yet.
    ///
    /// Returns false if it already fired or was never registered here.
    pub fn remove_continuation(&self, token: ContinuationToken) -> bool {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending { continuations, .. } => {
                let before = continuations.len();
                continuations.retain(|(t, _)| *t != token);
                continuations.len() != before
            }
            State::Completed(_) => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Completed(_))
    }

    /// The stored result, if completed
    pub fn try_result(&self) -> Option<Result<T>> {
        match &*self.inner.state.lock() {
            State::Completed(result) => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Block the calling thread until completion, then return the result.
    ///
    /// This parks the OS thread outright. Use `SchedulerHandle::wait_for`
    /// when the caller also has to keep a work queue moving.
    pub fn result(&self) -> Result<T> {
        self.inner.signal.wait();
        self.try_result()
            .unwrap_or_else(|| unreachable!("signal set before completion"))
    }

    /// Like `result`, but gives up with `Error::Timeout` after `timeout`
    pub fn result_timeout(&self, timeout: Duration) -> Result<T> {
        if !self.inner.signal.wait_timeout(timeout) {
            return Err(Error::Timeout);
        }
        self.try_result().unwrap_or(Err(Error::Timeout))
    }

    /// Completion flag shared with work queues
    pub fn signal(&self) -> &Arc<CompletionSignal> {
        &self.inner.signal
    }

    /// Number of continuations still waiting
    pub fn continuation_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Pending { continuations, .. } => continuations.len(),
            State::Completed(_) => 0,
        }
    }
}

impl<T: Clone + Send + 'static> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Pending { .. } => "pending",
            State::Completed(Ok(_)) => "completed",
            State::Completed(Err(_)) => "failed",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}

impl<T: Clone + Send + 'static> std::future::Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Completed(result) => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future as _;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;
    use std::thread;

    #[test]
    fn test_future_complete_once() {
        let future = TaskFuture::new();
        assert!(!future.is_completed());
        future.complete(7);
        assert!(future.is_completed());
        assert_eq!(future.result().unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_future_double_complete_panics() {
        let future = TaskFuture::new();
        future.complete(1);
        future.complete(2);
    }

    #[test]
    fn test_future_try_complete_rejects_second_value() {
        let future = TaskFuture::new();
        assert!(future.try_complete(1).is_ok());
        assert!(matches!(future.try_complete(2), Err(Error::AlreadyCompleted)));
        assert!(matches!(future.try_fail(Error::msg("late")), Err(Error::AlreadyCompleted)));
        assert_eq!(future.result().unwrap(), 1);
    }

    #[test]
    fn test_future_fail_delivers_error() {
        let future: TaskFuture<i32> = TaskFuture::new();
        future.fail(Error::msg("nope"));
        match future.result() {
            Err(Error::Message(m)) => assert_eq!(m, "nope"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_continuation_after_completion_fires_inline() {
        let future = TaskFuture::completed(5);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        future.on_complete(move |_, result| {
            *seen2.lock() = Some(result.clone().unwrap());
        });
        assert_eq!(*seen.lock(), Some(5));
    }

    #[test]
    fn test_continuations_fire_once_in_registration_order() {
        let future = TaskFuture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            future.on_complete(move |_, result: &Result<i32>| {
                order.lock().push((i, *result.as_ref().unwrap()));
            });
        }
        assert_eq!(future.continuation_count(), 4);
        assert!(order.lock().is_empty());

        future.complete(9);
        assert_eq!(*order.lock(), vec![(0, 9), (1, 9), (2, 9), (3, 9)]);
        assert_eq!(future.continuation_count(), 0);
    }

    #[test]
    fn test_remove_continuation() {
        let future = TaskFuture::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = future.on_complete(move |_, _: &Result<()>| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(future.remove_continuation(token));
        assert!(!future.remove_continuation(token));
        future.complete(());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_continuation_does_not_strand_others() {
        let future = TaskFuture::new();
        let later = Arc::new(AtomicUsize::new(0));
        future.on_complete(|_, _: &Result<i32>| panic!("continuation exploded"));
        let l = later.clone();
        future.on_complete(move |_, _| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        let caught = panic::catch_unwind(AssertUnwindSafe(|| future.complete(1)));
        let payload = caught.expect_err("the continuation panic is re-raised");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"continuation exploded"));

        assert_eq!(later.load(Ordering::SeqCst), 1);
        assert!(future.is_completed());
        assert_eq!(future.result_timeout(Duration::from_millis(100)).unwrap(), 1);
    }

    #[test]
    fn test_continuation_may_register_on_same_future() {
        let future = TaskFuture::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        future.on_complete(move |f, _: &Result<u8>| {
            let h2 = h.clone();
            f.on_complete(move |_, _| {
                h2.fetch_add(1, Ordering::SeqCst);
            });
            h.fetch_add(1, Ordering::SeqCst);
        });
        future.complete(1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_register_and_complete_loses_nothing() {
        for _ in 0..50 {
            let future = TaskFuture::new();
            let hits = Arc::new(AtomicUsize::new(0));

            let registrars: Vec<_> = (0..4)
                .map(|_| {
                    let future = future.clone();
                    let hits = hits.clone();
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let hits = hits.clone();
                            future.on_complete(move |_, _: &Result<u32>| {
                                hits.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    })
                })
                .collect();

            let completer = {
                let future = future.clone();
                thread::spawn(move || future.complete(3))
            };

            for r in registrars {
                r.join().unwrap();
            }
            completer.join().unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn test_result_blocks_until_completed_elsewhere() {
        let future = TaskFuture::new();
        let producer = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete("done".to_string());
        });
        assert_eq!(future.result().unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_result_timeout() {
        let future: TaskFuture<i32> = TaskFuture::new();
        assert!(matches!(
            future.result_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
    }

    struct ThreadWaker(thread::Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    #[test]
    fn test_future_is_awaitable() {
        let future = TaskFuture::new();
        let producer = future.clone();
        let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut pinned = future.clone();

        assert!(Pin::new(&mut pinned).poll(&mut cx).is_pending());
        thread::spawn(move || producer.complete(11u64));
        loop {
            if let Poll::Ready(v) = Pin::new(&mut pinned).poll(&mut cx) {
                assert_eq!(v.unwrap(), 11);
                break;
            }
            thread::park_timeout(Duration::from_millis(10));
        }
    }
}
