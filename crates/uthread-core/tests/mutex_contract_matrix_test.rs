use uthread_core::errno;
use uthread_core::sync::{MutexKind, MutexOp, MutexPhase, transition};

#[derive(Clone, Copy)]
struct Case {
    kind: MutexKind,
    phase: MutexPhase,
    op: MutexOp,
    next: MutexPhase,
    errno: i32,
    blocks: bool,
}

const fn case(
    kind: MutexKind,
    phase: MutexPhase,
    op: MutexOp,
    next: MutexPhase,
    errno: i32,
    blocks: bool,
) -> Case {
    Case {
        kind,
        phase,
        op,
        next,
        errno,
        blocks,
    }
}

fn matrix() -> Vec<Case> {
    use MutexKind::{ErrorCheck, Normal, Recursive};
    use MutexOp::{Destroy, Init, Lock, TryLock, Unlock};
    use MutexPhase::{Destroyed, LockedByOther, LockedBySelf, Unlocked};

    let mut cases = Vec::new();
    for kind in MutexKind::ALL {
        cases.extend([
            case(kind, Unlocked, Init, Unlocked, errno::EBUSY, false),
            case(kind, Unlocked, Lock, LockedBySelf, 0, false),
            case(kind, Unlocked, TryLock, LockedBySelf, 0, false),
            case(kind, Unlocked, Unlock, Unlocked, errno::EPERM, false),
            case(kind, Unlocked, Destroy, Destroyed, 0, false),
            case(kind, LockedByOther, Init, LockedByOther, errno::EBUSY, false),
            case(kind, LockedByOther, Lock, LockedByOther, 0, true),
            case(kind, LockedByOther, TryLock, LockedByOther, errno::EBUSY, false),
            case(kind, LockedByOther, Unlock, LockedByOther, errno::EPERM, false),
            case(kind, LockedByOther, Destroy, LockedByOther, errno::EBUSY, false),
            case(kind, LockedBySelf, Init, LockedBySelf, errno::EBUSY, false),
            case(kind, LockedBySelf, Unlock, Unlocked, 0, false),
            case(kind, LockedBySelf, Destroy, LockedBySelf, errno::EBUSY, false),
            case(kind, Destroyed, Init, Unlocked, 0, false),
            case(kind, Destroyed, Lock, Destroyed, errno::EINVAL, false),
            case(kind, Destroyed, TryLock, Destroyed, errno::EINVAL, false),
            case(kind, Destroyed, Unlock, Destroyed, errno::EINVAL, false),
            case(kind, Destroyed, Destroy, Destroyed, errno::EINVAL, false),
        ]);
    }
    cases.extend([
        case(Normal, LockedBySelf, Lock, LockedBySelf, 0, true),
        case(Normal, LockedBySelf, TryLock, LockedBySelf, errno::EBUSY, false),
        case(ErrorCheck, LockedBySelf, Lock, LockedBySelf, errno::EDEADLK, false),
        case(ErrorCheck, LockedBySelf, TryLock, LockedBySelf, errno::EBUSY, false),
        case(Recursive, LockedBySelf, Lock, LockedBySelf, 0, false),
        case(Recursive, LockedBySelf, TryLock, LockedBySelf, 0, false),
    ]);
    cases
}

#[test]
fn matrix_covers_every_cell() {
    assert_eq!(matrix().len(), MutexKind::ALL.len() * 4 * 5);
}

#[test]
fn transitions_match_matrix() {
    for c in matrix() {
        let t = transition(c.kind, c.phase, c.op);
        let label = format!("{:?} {:?} {:?}", c.kind, c.phase, c.op);
        assert_eq!(t.next, c.next, "next phase for {label}");
        assert_eq!(t.errno, c.errno, "errno for {label}");
        assert_eq!(t.blocks, c.blocks, "blocking for {label}");
        assert_eq!(t.error().is_some(), c.errno != 0, "error mapping for {label}");
    }
}
