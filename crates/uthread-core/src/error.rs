//! Error type shared by every runtime operation.
//!
//! Caller-facing conditions are values of [`ThreadError`]. Two reporting
//! paths sit beside it:
//! - [`violation`] for protocol misuse (unlocking a mutex you don't own,
//!   joining a detached thread). It records the event and, under
//!   [`ViolationPolicy::Abort`](crate::config::ViolationPolicy), aborts.
//! - [`fatal`] for broken scheduler invariants. It always aborts.

use thiserror::Error;

use crate::errno;
use crate::trace::{self, TraceKind};

pub type Result<T> = std::result::Result<T, ThreadError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("stack of {requested} bytes is below the {minimum}-byte minimum")]
    StackTooSmall { requested: usize, minimum: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("cannot allocate thread resources (errno {0})")]
    ResourceExhausted(i32),
    #[error("calling thread does not own the mutex")]
    NotOwner,
    #[error("resource busy")]
    Busy,
    #[error("operation would deadlock")]
    Deadlock,
    #[error("no such thread")]
    NoSuchThread,
    #[error("thread is not joinable")]
    NotJoinable,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation not supported for this thread")]
    NotSupported,
    #[error("no runtime is active on this kernel thread")]
    NoRuntime,
    #[error("thread was canceled")]
    Canceled,
    #[error("thread panicked: {0}")]
    Panicked(String),
    #[error("initial thread exited before returning")]
    InitialThreadExited,
    #[error("system call failed (errno {0})")]
    Os(i32),
}

impl ThreadError {
    /// POSIX errno equivalent, used by the C surface.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::StackTooSmall { .. } | Self::InvalidArgument(_) | Self::NotJoinable => {
                errno::EINVAL
            }
            Self::ResourceExhausted(e) | Self::Os(e) => *e,
            Self::NotOwner => errno::EPERM,
            Self::Busy => errno::EBUSY,
            Self::Deadlock => errno::EDEADLK,
            Self::NoSuchThread => errno::ESRCH,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::NotSupported => errno::ENOTSUP,
            Self::NoRuntime => errno::EPERM,
            Self::Canceled => errno::ECANCELED,
            Self::Panicked(_) | Self::InitialThreadExited => errno::EINVAL,
        }
    }

    /// Wrap the errno left by the last failing libc call.
    #[must_use]
    pub fn last_os_error() -> Self {
        Self::Os(errno::last())
    }

    pub(crate) fn from_alloc(e: i32) -> Self {
        if e == errno::ENOMEM || e == errno::EAGAIN {
            Self::ResourceExhausted(e)
        } else {
            Self::Os(e)
        }
    }
}

impl From<ThreadError> for std::io::Error {
    fn from(err: ThreadError) -> Self {
        match err {
            ThreadError::TimedOut => std::io::Error::from(std::io::ErrorKind::TimedOut),
            other => std::io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// Report a protocol violation and hand the error back for propagation.
pub(crate) fn violation(runtime: u64, thread: u64, err: ThreadError, what: &'static str) -> ThreadError {
    trace::count_violation();
    trace::record(runtime, thread, TraceKind::Violation, format!("{what}: {err}"));
    if crate::config::current_violation_policy().aborts() {
        eprintln!("uthread: protocol violation in {what}: {err}");
        std::process::abort();
    }
    err
}

/// Scheduler invariant broken. Never returns.
#[cold]
pub(crate) fn fatal(msg: &str) -> ! {
    trace::record(0, 0, TraceKind::Fatal, msg.to_string());
    eprintln!("uthread: fatal scheduler error: {msg}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix_classes() {
        assert_eq!(ThreadError::NotOwner.errno(), errno::EPERM);
        assert_eq!(ThreadError::Deadlock.errno(), errno::EDEADLK);
        assert_eq!(ThreadError::NoSuchThread.errno(), errno::ESRCH);
        assert_eq!(ThreadError::NotJoinable.errno(), errno::EINVAL);
        assert_eq!(ThreadError::Busy.errno(), errno::EBUSY);
        assert_eq!(ThreadError::TimedOut.errno(), errno::ETIMEDOUT);
        assert_eq!(ThreadError::NotSupported.errno(), errno::ENOTSUP);
        assert_eq!(
            ThreadError::StackTooSmall { requested: 1, minimum: 2 }.errno(),
            errno::EINVAL
        );
    }

    #[test]
    fn os_errors_pass_through_unchanged() {
        assert_eq!(ThreadError::Os(errno::EBADF).errno(), errno::EBADF);
        assert_eq!(ThreadError::Os(1234).errno(), 1234);
    }

    #[test]
    fn allocation_failures_classify_as_exhaustion() {
        assert_eq!(
            ThreadError::from_alloc(errno::ENOMEM),
            ThreadError::ResourceExhausted(errno::ENOMEM)
        );
        assert_eq!(ThreadError::from_alloc(errno::EINVAL), ThreadError::Os(errno::EINVAL));
    }

    #[test]
    fn converts_into_io_error() {
        let io: std::io::Error = ThreadError::TimedOut.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        let io: std::io::Error = ThreadError::Os(errno::EBADF).into();
        assert_eq!(io.raw_os_error(), Some(errno::EBADF));
    }
}
