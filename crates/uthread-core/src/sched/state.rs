//! Thread state machine and wait bookkeeping.

use std::os::fd::RawFd;

use super::tcb::ThreadId;
use crate::io::Interest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Running,
    Ready,
    BlockedOnMutex,
    BlockedOnCondvar,
    BlockedOnIo,
    BlockedOnJoin,
    Sleeping,
    Suspended,
    Dead,
}

impl ThreadState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready => "ready",
            Self::BlockedOnMutex => "blocked_on_mutex",
            Self::BlockedOnCondvar => "blocked_on_condvar",
            Self::BlockedOnIo => "blocked_on_io",
            Self::BlockedOnJoin => "blocked_on_join",
            Self::Sleeping => "sleeping",
            Self::Suspended => "suspended",
            Self::Dead => "dead",
        }
    }

    /// Waiting on something other than the scheduler itself.
    #[must_use]
    pub const fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::BlockedOnMutex
                | Self::BlockedOnCondvar
                | Self::BlockedOnIo
                | Self::BlockedOnJoin
                | Self::Sleeping
        )
    }

    /// Legal edges of the state machine. Anything else is a scheduler bug.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        match self {
            Self::Running => !matches!(next, Self::Running),
            Self::Ready => matches!(next, Self::Running | Self::Suspended),
            Self::BlockedOnMutex
            | Self::BlockedOnCondvar
            | Self::BlockedOnIo
            | Self::BlockedOnJoin
            | Self::Sleeping => matches!(next, Self::Ready | Self::Suspended),
            Self::Suspended => matches!(next, Self::Ready),
            Self::Dead => false,
        }
    }
}

/// Why a parked thread was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// Plain reschedule after a yield.
    Scheduled,
    /// Mutex or descriptor claim handed directly to this thread.
    Handoff,
    /// Condition variable signal or broadcast.
    Signaled,
    TimedOut,
    IoReady,
    /// The descriptor it waited on was closed or replaced.
    Revoked,
    Canceled,
    Joined,
    Resumed,
    /// Every other thread has finished.
    Drained,
}

/// Identity of a wait queue kept by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WaitKey {
    Mutex(u64),
    Condvar(u64),
    FdClaim(RawFd, Interest),
}

/// The one structure a thread is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Unlinked,
    Ready,
    Wait(WaitKey),
    Io(RawFd, Interest),
    Join(ThreadId),
    Sleep,
    Drain,
}

impl Link {
    /// Whether a pending cancellation may interrupt this wait.
    pub(crate) const fn is_cancel_point(self, state: ThreadState) -> bool {
        match self {
            Self::Wait(WaitKey::Mutex(_)) | Self::Drain | Self::Unlinked | Self::Ready => false,
            _ => matches!(
                state,
                ThreadState::BlockedOnCondvar
                    | ThreadState::BlockedOnIo
                    | ThreadState::BlockedOnJoin
                    | ThreadState::Sleeping
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ThreadState; 9] = [
        ThreadState::Running,
        ThreadState::Ready,
        ThreadState::BlockedOnMutex,
        ThreadState::BlockedOnCondvar,
        ThreadState::BlockedOnIo,
        ThreadState::BlockedOnJoin,
        ThreadState::Sleeping,
        ThreadState::Suspended,
        ThreadState::Dead,
    ];

    #[test]
    fn dead_is_terminal() {
        for next in ALL {
            assert!(!ThreadState::Dead.can_transition(next));
        }
    }

    #[test]
    fn only_ready_threads_start_running() {
        for from in ALL {
            let ok = from.can_transition(ThreadState::Running);
            assert_eq!(ok, from == ThreadState::Ready, "{from:?}");
        }
    }

    #[test]
    fn blocked_threads_never_die_directly() {
        for from in ALL.into_iter().filter(|s| s.is_blocked()) {
            assert!(!from.can_transition(ThreadState::Dead));
            assert!(from.can_transition(ThreadState::Ready));
        }
    }

    #[test]
    fn mutex_waits_are_not_cancel_points() {
        let link = Link::Wait(WaitKey::Mutex(1));
        assert!(!link.is_cancel_point(ThreadState::BlockedOnMutex));
        assert!(Link::Wait(WaitKey::Condvar(1)).is_cancel_point(ThreadState::BlockedOnCondvar));
        assert!(Link::Sleep.is_cancel_point(ThreadState::Sleeping));
        assert!(!Link::Drain.is_cancel_point(ThreadState::BlockedOnJoin));
    }
}
