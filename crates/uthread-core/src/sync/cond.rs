//! Condition variables.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use super::mutex::{Mutex, MutexGuard, Owner, next_primitive_id};
use crate::atomic_lock::SpinLock;
use crate::error::{Result, ThreadError};
use crate::sched::{Link, ThreadState, WaitKey, WakeReason, runtime};

#[derive(Debug, Default)]
struct CondInner {
    /// Mutex shared by the current waiters.
    bound: Option<u64>,
    /// Threads inside a wait call, signaled or not.
    waiters: usize,
    destroyed: bool,
}

pub struct Condvar {
    id: u64,
    inner: SpinLock<CondInner>,
    _local: PhantomData<*const ()>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Condvar {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: next_primitive_id(),
            inner: SpinLock::new(CondInner::default()),
            _local: PhantomData,
        }
    }

    /// Release `mutex`, sleep until signaled, then hold `mutex` again.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.wait_inner(mutex, None).map(|_| ())
    }

    /// Like [`wait`](Self::wait) but bounded. Returns `true` on timeout; the
    /// mutex is held again either way.
    pub fn wait_until(&self, mutex: &Mutex, deadline: Instant) -> Result<bool> {
        self.wait_inner(mutex, Some(deadline))
    }

    /// A timeout past the end of the clock waits without a deadline.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> Result<bool> {
        self.wait_inner(mutex, Instant::now().checked_add(timeout))
    }

    pub fn wait_guard(&self, guard: &MutexGuard<'_>) -> Result<()> {
        self.wait(guard.mutex())
    }

    fn wait_inner(&self, mutex: &Mutex, deadline: Option<Instant>) -> Result<bool> {
        let rt = runtime()?;
        rt.cancel_point();
        let me = Owner::current(rt);

        let mut cv = self.inner.lock();
        if cv.destroyed {
            drop(cv);
            return Err(rt.violation(ThreadError::InvalidArgument("condvar is destroyed"), "cond_wait"));
        }
        if cv.waiters > 0 && cv.bound.is_some_and(|b| b != mutex.id()) {
            drop(cv);
            return Err(rt.violation(
                ThreadError::InvalidArgument("condvar waiters must share one mutex"),
                "cond_wait",
            ));
        }
        let mut held = mutex.inner().lock();
        let Some(depth) = Mutex::held_depth(&held, me) else {
            drop(held);
            drop(cv);
            return Err(rt.violation(ThreadError::NotOwner, "cond_wait"));
        };
        cv.bound = Some(mutex.id());
        cv.waiters += 1;

        // Releasing the mutex and queueing on the condvar happen under one
        // scheduler lock, so no signal can fall between them.
        let mut st = rt.sched.lock();
        mutex.release_owned(&mut held, &mut st, rt.id);
        drop(held);
        drop(cv);
        let reason = rt.park(
            st,
            ThreadState::BlockedOnCondvar,
            Link::Wait(WaitKey::Condvar(self.id)),
            deadline,
        );

        {
            let mut cv = self.inner.lock();
            cv.waiters -= 1;
            if cv.waiters == 0 {
                cv.bound = None;
            }
        }
        mutex.relock(depth)?;
        if reason == WakeReason::Canceled {
            rt.cancel_point();
        }
        Ok(reason == WakeReason::TimedOut)
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self) -> Result<()> {
        self.notify(false, "cond_signal")
    }

    pub fn broadcast(&self) -> Result<()> {
        self.notify(true, "cond_broadcast")
    }

    fn notify(&self, all: bool, what: &'static str) -> Result<()> {
        let rt = runtime()?;
        let cv = self.inner.lock();
        if cv.destroyed {
            drop(cv);
            return Err(rt.violation(ThreadError::InvalidArgument("condvar is destroyed"), what));
        }
        let mut st = rt.sched.lock();
        let key = WaitKey::Condvar(self.id);
        if all {
            st.wake_all(key, WakeReason::Signaled);
        } else {
            st.wake_first(key, WakeReason::Signaled);
        }
        Ok(())
    }

    /// Fails with `Busy` while any thread is still inside a wait.
    pub fn destroy(&self) -> Result<()> {
        let rt = runtime()?;
        let mut cv = self.inner.lock();
        let err = if cv.destroyed {
            ThreadError::InvalidArgument("condvar is destroyed")
        } else if cv.waiters > 0 {
            ThreadError::Busy
        } else {
            cv.destroyed = true;
            return Ok(());
        };
        drop(cv);
        Err(rt.violation(err, "cond_destroy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::run;

    #[test]
    fn wait_requires_ownership() {
        run(|| {
            let m = Mutex::default();
            let cv = Condvar::new();
            assert_eq!(cv.wait(&m), Err(ThreadError::NotOwner));
        })
        .unwrap();
    }

    #[test]
    fn timed_wait_reacquires_the_mutex() {
        run(|| {
            let m = Mutex::default();
            let cv = Condvar::new();
            m.lock().unwrap();
            let timed_out = cv.wait_timeout(&m, Duration::from_millis(2)).unwrap();
            assert!(timed_out);
            assert!(m.is_locked());
            m.unlock().unwrap();
        })
        .unwrap();
    }

    #[test]
    fn recursive_depth_survives_a_wait() {
        run(|| {
            let m = Mutex::new(super::super::MutexKind::Recursive);
            let cv = Condvar::new();
            m.lock().unwrap();
            m.lock().unwrap();
            assert!(cv.wait_timeout(&m, Duration::from_millis(1)).unwrap());
            m.unlock().unwrap();
            assert!(m.is_locked());
            m.unlock().unwrap();
            assert!(!m.is_locked());
        })
        .unwrap();
    }

    #[test]
    fn signal_without_waiters_is_a_no_op() {
        run(|| {
            let cv = Condvar::new();
            cv.signal().unwrap();
            cv.broadcast().unwrap();
            cv.destroy().unwrap();
            assert!(matches!(cv.signal(), Err(ThreadError::InvalidArgument(_))));
        })
        .unwrap();
    }
}
