//! Scheduler error types.

use crate::scheduler::TaskId;
use std::sync::Arc;

/// Errors delivered through a future's error channel or raised by the scheduler.
///
/// `Error` is `Clone` because a single failure is handed to every continuation
/// registered on the failed future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A coroutine produced a suspension value the driver cannot resume from
    #[error("Protocol violation in task {task:?} ({name}): {detail}")]
    ProtocolViolation {
        /// The offending task
        task: TaskId,
        /// Type name of the offending coroutine
        name: String,
        /// What went wrong
        detail: String,
    },

    /// A background task failed and no error handler suppressed it
    #[error("Unhandled error in background task {task:?}: {source}")]
    UnhandledBackground {
        /// The failed task
        task: TaskId,
        /// The error the task failed with
        source: Box<Error>,
    },

    /// A future was completed more than once
    #[error("Future already completed")]
    AlreadyCompleted,

    /// A user-supplied error
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    /// A plain failure message
    #[error("{0}")]
    Message(String),

    /// A task body panicked
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// A resumed value did not have the type the task body asked for
    #[error("Type mismatch: expected {expected}")]
    TypeMismatch {
        /// Name of the requested type
        expected: &'static str,
    },

    /// The scheduler was disposed before the operation finished
    #[error("Scheduler disposed")]
    Disposed,

    /// A bounded wait elapsed
    #[error("Timed out")]
    Timeout,
}

impl Error {
    /// Wrap any error type.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(error))
    }

    /// Build an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Whether this is a protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. })
    }

    /// Render a panic payload the way `std` prints it.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Error::Panicked((*s).to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Error::Panicked(s.clone())
        } else if let Some(e) = payload.downcast_ref::<Error>() {
            e.clone()
        } else {
            Error::Panicked("non-string panic payload".to_string())
        }
    }
}

/// Scheduler result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::msg("boom");
        assert_eq!(err.to_string(), "boom");

        let io = Error::failed(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.to_string(), "disk");
    }

    #[test]
    fn test_unhandled_background_wraps_source() {
        let task = TaskId::new();
        let err = Error::UnhandledBackground {
            task,
            source: Box::new(Error::msg("inner")),
        };
        assert!(err.to_string().contains("inner"));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn test_from_panic_payloads() {
        let p: Box<dyn std::any::Any + Send> = Box::new("static");
        assert!(matches!(Error::from_panic(p.as_ref()), Error::Panicked(s) if s == "static"));

        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert!(matches!(Error::from_panic(p.as_ref()), Error::Panicked(s) if s == "owned"));

        let p: Box<dyn std::any::Any + Send> = Box::new(Error::Disposed);
        assert!(matches!(Error::from_panic(p.as_ref()), Error::Disposed));
    }
}
