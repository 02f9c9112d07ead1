//! Mutex with FIFO hand-off.
//!
//! The lock word is an [`AtomicLock`]. Contended lockers spin on it briefly
//! and then park on the mutex's wait queue in the scheduler. Unlock with
//! waiters never frees the word: ownership passes straight to the head of
//! the queue, so grants follow blocking order.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::contract::{MutexKind, MutexOp, MutexPhase, transition};
use crate::atomic_lock::{AtomicLock, SpinLock};
use crate::error::{Result, ThreadError, fatal};
use crate::sched::{Link, Runtime, SchedState, ThreadId, ThreadState, WaitKey, WakeReason, runtime};
use crate::trace::{self, TraceKind};

static NEXT_PRIMITIVE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_primitive_id() -> u64 {
    NEXT_PRIMITIVE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A thread, qualified by the runtime it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owner {
    runtime: u64,
    thread: ThreadId,
}

impl Owner {
    pub(crate) fn current(rt: &Runtime) -> Self {
        Self {
            runtime: rt.id,
            thread: rt.current_id(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MutexInner {
    owner: Option<Owner>,
    depth: u32,
    destroyed: bool,
}

impl MutexInner {
    fn phase(&self, me: Owner) -> MutexPhase {
        match self.owner {
            _ if self.destroyed => MutexPhase::Destroyed,
            None => MutexPhase::Unlocked,
            Some(o) if o == me => MutexPhase::LockedBySelf,
            Some(_) => MutexPhase::LockedByOther,
        }
    }
}

/// Shared between green threads of one runtime through `Rc` or plain
/// borrows; it is deliberately neither `Send` nor `Sync`.
pub struct Mutex {
    id: u64,
    kind: MutexKind,
    word: AtomicLock,
    inner: SpinLock<MutexInner>,
    _local: PhantomData<*const ()>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(MutexKind::Normal)
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("locked", &self.word.is_locked())
            .finish()
    }
}

impl Mutex {
    #[must_use]
    pub fn new(kind: MutexKind) -> Self {
        Self {
            id: next_primitive_id(),
            kind,
            word: AtomicLock::new(),
            inner: SpinLock::new(MutexInner::default()),
            _local: PhantomData,
        }
    }

    #[must_use]
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Advisory: whether some thread holds the mutex right now.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.is_locked()
    }

    pub fn lock(&self) -> Result<()> {
        self.acquire(MutexOp::Lock, None)
    }

    pub fn try_lock(&self) -> Result<()> {
        self.acquire(MutexOp::TryLock, None)
    }

    /// Lock, giving up with `TimedOut` once `deadline` passes.
    pub fn lock_until(&self, deadline: Instant) -> Result<()> {
        self.acquire(MutexOp::Lock, Some(deadline))
    }

    pub fn lock_timeout(&self, timeout: Duration) -> Result<()> {
        self.acquire(MutexOp::Lock, Instant::now().checked_add(timeout))
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    pub fn unlock(&self) -> Result<()> {
        let rt = runtime()?;
        let me = Owner::current(rt);
        let mut inner = self.inner.lock();
        let t = transition(self.kind, inner.phase(me), MutexOp::Unlock);
        if let Some(err) = t.error() {
            drop(inner);
            return Err(rt.violation(err, "mutex_unlock"));
        }
        if inner.depth > 1 {
            inner.depth -= 1;
            return Ok(());
        }
        let mut st = rt.sched.lock();
        self.release_owned(&mut inner, &mut st, rt.id);
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        self.settle(MutexOp::Destroy, "mutex_destroy", |inner| inner.destroyed = true)
    }

    /// Bring a destroyed mutex back into service.
    pub fn reinit(&self) -> Result<()> {
        self.settle(MutexOp::Init, "mutex_init", |inner| *inner = MutexInner::default())
    }

    fn settle(&self, op: MutexOp, what: &'static str, apply: impl FnOnce(&mut MutexInner)) -> Result<()> {
        let rt = runtime()?;
        let me = Owner::current(rt);
        let mut inner = self.inner.lock();
        let t = transition(self.kind, inner.phase(me), op);
        if let Some(err) = t.error() {
            drop(inner);
            return Err(rt.violation(err, what));
        }
        apply(&mut inner);
        Ok(())
    }

    fn acquire(&self, op: MutexOp, deadline: Option<Instant>) -> Result<()> {
        let rt = runtime()?;
        let me = Owner::current(rt);
        let mut inner = self.inner.lock();
        let phase = inner.phase(me);
        let t = transition(self.kind, phase, op);
        if let Some(err) = t.error() {
            drop(inner);
            if op == MutexOp::TryLock && err == ThreadError::Busy {
                return Err(err);
            }
            return Err(rt.violation(err, "mutex_lock"));
        }
        if !t.blocks {
            if phase == MutexPhase::LockedBySelf {
                inner.depth += 1;
            } else {
                self.take_word(&mut inner, me);
            }
            return Ok(());
        }
        drop(inner);

        for _ in 0..rt.config.spin_limit {
            std::hint::spin_loop();
            let mut inner = self.inner.lock();
            if inner.owner.is_none() && !inner.destroyed {
                self.take_word(&mut inner, me);
                return Ok(());
            }
        }

        loop {
            let mut inner = self.inner.lock();
            if inner.owner.is_none() {
                if inner.destroyed {
                    drop(inner);
                    return Err(rt.violation(ThreadError::InvalidArgument("mutex is destroyed"), "mutex_lock"));
                }
                self.take_word(&mut inner, me);
                return Ok(());
            }
            let st = rt.sched.lock();
            drop(inner);
            let key = WaitKey::Mutex(self.id);
            match rt.park(st, ThreadState::BlockedOnMutex, Link::Wait(key), deadline) {
                WakeReason::Handoff => {
                    if self.inner.lock().owner != Some(me) {
                        fatal("mutex hand-off reached a thread that does not own it");
                    }
                    return Ok(());
                }
                WakeReason::TimedOut => return Err(ThreadError::TimedOut),
                _ => {}
            }
        }
    }

    fn take_word(&self, inner: &mut MutexInner, me: Owner) {
        if !self.word.try_acquire() {
            fatal("mutex word held with no recorded owner");
        }
        inner.owner = Some(me);
        inner.depth = 1;
    }

    /// Give up ownership entirely: hand it to the first waiter, or free the
    /// word when nobody waits.
    pub(crate) fn release_owned(&self, inner: &mut MutexInner, st: &mut SchedState, runtime: u64) {
        match st.wake_first(WaitKey::Mutex(self.id), WakeReason::Handoff) {
            Some(next) => {
                inner.owner = Some(Owner { runtime, thread: next });
                inner.depth = 1;
                trace::count_handoff();
                st.trace(next, TraceKind::Handoff, || format!("mutex {}", self.id));
            }
            None => {
                inner.owner = None;
                inner.depth = 0;
                self.word.release();
            }
        }
    }

    pub(crate) fn inner(&self) -> &SpinLock<MutexInner> {
        &self.inner
    }

    /// Recursion depth held by `me`, or `None` if `me` is not the owner.
    pub(crate) fn held_depth(inner: &MutexInner, me: Owner) -> Option<u32> {
        (inner.owner == Some(me) && !inner.destroyed).then_some(inner.depth)
    }

    /// Reacquire after a condition wait, restoring the saved depth.
    pub(crate) fn relock(&self, depth: u32) -> Result<()> {
        self.acquire(MutexOp::Lock, None)?;
        self.inner.lock().depth = depth;
        Ok(())
    }
}

/// Holds a [`Mutex`] until dropped, unwinds included.
#[must_use = "dropping the guard unlocks the mutex immediately"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl MutexGuard<'_> {
    #[must_use]
    pub fn mutex(&self) -> &Mutex {
        self.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}
