//! Error types shared across the runtime.

use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors carried by rejected futures.
///
/// Rejections fan out to every chained dependent, so the error is `Clone`
/// and every copy compares equal to the original.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The future was consulted before it settled.
    #[error("future is still pending")]
    Pending,

    /// Explicit or discard-driven cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A timeout future fired.
    #[error("operation timed out")]
    TimedOut,

    /// Send or receive on a closed channel half.
    #[error("channel is closed")]
    ChannelClosed,

    /// Wait on a closed semaphore.
    #[error("semaphore is closed")]
    SemaphoreClosed,

    /// A typed await observed a resolved value of a different type.
    #[error("got type {found}, expected {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Glue code received a result type it cannot represent.
    #[error("unsupported result type: {0}")]
    TypeNotSupported(&'static str),

    /// A fiber returned without producing a future.
    #[error("fiber completed without a result")]
    RoutineCompleted,

    /// A descriptor operation failed; the kernel errno is preserved.
    #[error("{message} (errno {errno})")]
    Io { errno: i32, message: String },

    /// A future set can no longer meet its success threshold.
    #[error("too many failures, cannot complete")]
    TooManyFailures,
}

impl Error {
    /// Builds an [`Error::Io`] from a raw errno value.
    pub fn from_errno(errno: i32) -> Self {
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        Error::Io { errno, message }
    }

    /// Builds an [`Error::Io`] from the calling thread's `errno`.
    pub fn last_os_error() -> Self {
        let err = std::io::Error::last_os_error();
        Error::Io {
            errno: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this error is a timeout.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_preserved() {
        let err = Error::from_errno(libc::ENOENT);
        match err {
            Error::Io { errno, .. } => assert_eq!(errno, libc::ENOENT),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clones_compare_equal() {
        let err = Error::TypeMismatch {
            expected: "int64",
            found: "string",
        };
        assert_eq!(err.clone(), err);
    }
}
