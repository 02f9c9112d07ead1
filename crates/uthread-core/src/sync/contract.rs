//! Mutex transition contract.
//!
//! Every mutex operation first asks [`transition`] what the caller's view of
//! the mutex allows. The table is pure so it can be checked exhaustively
//! without a runtime; [`Mutex`](super::Mutex) only carries out the answer.

use crate::errno;
use crate::error::ThreadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum MutexKind {
    /// Relock by the owner blocks forever.
    #[default]
    Normal = 0,
    /// The owner may relock; each lock needs its own unlock.
    Recursive = 1,
    /// Relock by the owner fails with `EDEADLK`.
    ErrorCheck = 2,
}

impl MutexKind {
    pub const ALL: [Self; 3] = [Self::Normal, Self::Recursive, Self::ErrorCheck];

    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::Recursive),
            2 => Some(Self::ErrorCheck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

/// The mutex as seen by the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexPhase {
    Unlocked,
    LockedBySelf,
    LockedByOther,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexOp {
    Init,
    Lock,
    TryLock,
    Unlock,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: MutexPhase,
    /// 0 on success.
    pub errno: i32,
    /// The caller must wait for another thread to make progress.
    pub blocks: bool,
}

impl Transition {
    const fn ok(next: MutexPhase) -> Self {
        Self {
            next,
            errno: 0,
            blocks: false,
        }
    }

    const fn fail(stay: MutexPhase, errno: i32) -> Self {
        Self {
            next: stay,
            errno,
            blocks: false,
        }
    }

    const fn wait(stay: MutexPhase) -> Self {
        Self {
            next: stay,
            errno: 0,
            blocks: true,
        }
    }

    /// The refusal as a caller-facing error, `None` when the op may proceed.
    #[must_use]
    pub fn error(&self) -> Option<ThreadError> {
        match self.errno {
            0 => None,
            e if e == errno::EPERM => Some(ThreadError::NotOwner),
            e if e == errno::EBUSY => Some(ThreadError::Busy),
            e if e == errno::EDEADLK => Some(ThreadError::Deadlock),
            _ => Some(ThreadError::InvalidArgument("mutex is destroyed")),
        }
    }
}

#[must_use]
pub const fn transition(kind: MutexKind, phase: MutexPhase, op: MutexOp) -> Transition {
    use MutexOp as Op;
    use MutexPhase as P;

    match (phase, op) {
        (P::Destroyed, Op::Init) => Transition::ok(P::Unlocked),
        (P::Destroyed, _) => Transition::fail(P::Destroyed, errno::EINVAL),

        (_, Op::Init) => Transition::fail(phase, errno::EBUSY),

        (P::Unlocked, Op::Lock | Op::TryLock) => Transition::ok(P::LockedBySelf),
        (P::Unlocked, Op::Unlock) => Transition::fail(P::Unlocked, errno::EPERM),
        (P::Unlocked, Op::Destroy) => Transition::ok(P::Destroyed),

        (P::LockedByOther, Op::Lock) => Transition::wait(P::LockedByOther),
        (P::LockedByOther, Op::TryLock | Op::Destroy) => {
            Transition::fail(P::LockedByOther, errno::EBUSY)
        }
        (P::LockedByOther, Op::Unlock) => Transition::fail(P::LockedByOther, errno::EPERM),

        (P::LockedBySelf, Op::Unlock) => Transition::ok(P::Unlocked),
        (P::LockedBySelf, Op::Destroy) => Transition::fail(P::LockedBySelf, errno::EBUSY),
        (P::LockedBySelf, Op::Lock) => match kind {
            MutexKind::Recursive => Transition::ok(P::LockedBySelf),
            MutexKind::ErrorCheck => Transition::fail(P::LockedBySelf, errno::EDEADLK),
            MutexKind::Normal => Transition::wait(P::LockedBySelf),
        },
        (P::LockedBySelf, Op::TryLock) => match kind {
            MutexKind::Recursive => Transition::ok(P::LockedBySelf),
            _ => Transition::fail(P::LockedBySelf, errno::EBUSY),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_raw_values() {
        assert_eq!(MutexKind::Normal.as_raw(), 0);
        assert_eq!(MutexKind::Recursive.as_raw(), 1);
        assert_eq!(MutexKind::ErrorCheck.as_raw(), 2);
        for kind in MutexKind::ALL {
            assert_eq!(MutexKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(MutexKind::from_raw(3), None);
        assert_eq!(MutexKind::from_raw(-1), None);
    }

    #[test]
    fn normal_relock_blocks() {
        let t = transition(MutexKind::Normal, MutexPhase::LockedBySelf, MutexOp::Lock);
        assert_eq!(t, Transition::wait(MutexPhase::LockedBySelf));
    }

    #[test]
    fn errorcheck_relock_is_edeadlk() {
        let t = transition(MutexKind::ErrorCheck, MutexPhase::LockedBySelf, MutexOp::Lock);
        assert_eq!(t.errno, errno::EDEADLK);
        assert_eq!(t.error(), Some(ThreadError::Deadlock));
        assert!(!t.blocks);
    }

    #[test]
    fn recursive_relock_nests() {
        for op in [MutexOp::Lock, MutexOp::TryLock] {
            let t = transition(MutexKind::Recursive, MutexPhase::LockedBySelf, op);
            assert_eq!(t, Transition::ok(MutexPhase::LockedBySelf));
        }
    }

    #[test]
    fn unlock_without_ownership_is_eperm() {
        for kind in MutexKind::ALL {
            for phase in [MutexPhase::Unlocked, MutexPhase::LockedByOther] {
                let t = transition(kind, phase, MutexOp::Unlock);
                assert_eq!(t.error(), Some(ThreadError::NotOwner), "{kind:?} {phase:?}");
            }
        }
    }

    #[test]
    fn destroy_while_locked_is_ebusy() {
        for kind in MutexKind::ALL {
            for phase in [MutexPhase::LockedBySelf, MutexPhase::LockedByOther] {
                let t = transition(kind, phase, MutexOp::Destroy);
                assert_eq!(t.errno, errno::EBUSY);
                assert_eq!(t.next, phase);
            }
        }
    }

    #[test]
    fn destroyed_accepts_only_init() {
        for kind in MutexKind::ALL {
            for op in [MutexOp::Lock, MutexOp::TryLock, MutexOp::Unlock, MutexOp::Destroy] {
                let t = transition(kind, MutexPhase::Destroyed, op);
                assert_eq!(t.errno, errno::EINVAL);
                assert_eq!(t.next, MutexPhase::Destroyed);
            }
            let t = transition(kind, MutexPhase::Destroyed, MutexOp::Init);
            assert_eq!(t, Transition::ok(MutexPhase::Unlocked));
        }
    }

    #[test]
    fn only_lock_ever_blocks() {
        let phases = [
            MutexPhase::Unlocked,
            MutexPhase::LockedBySelf,
            MutexPhase::LockedByOther,
            MutexPhase::Destroyed,
        ];
        let ops = [
            MutexOp::Init,
            MutexOp::Lock,
            MutexOp::TryLock,
            MutexOp::Unlock,
            MutexOp::Destroy,
        ];
        for kind in MutexKind::ALL {
            for phase in phases {
                for op in ops {
                    let t = transition(kind, phase, op);
                    if t.blocks {
                        assert_eq!(op, MutexOp::Lock);
                        assert_eq!(t.errno, 0);
                    }
                }
            }
        }
    }
}
