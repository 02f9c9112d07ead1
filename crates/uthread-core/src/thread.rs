//! Thread lifecycle: spawning, joining, exit, cancellation and queries.
//!
//! Every function here acts on the runtime of the calling kernel thread and
//! fails with [`ThreadError::NoRuntime`] outside one.

use std::any::Any;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use crate::error::{Result, ThreadError, fatal};
use crate::sched::{Outcome, ThreadId, ThreadState, exit_current, runtime};

/// Thread factory with per-thread settings.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    detached: bool,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Usable stack in bytes; defaults to the runtime's configured size.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Start the thread detached. Its handle can no longer join it.
    #[must_use]
    pub fn detached(mut self, on: bool) -> Self {
        self.detached = on;
        self
    }

    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let rt = runtime()?;
        let start = Box::new(move || Box::new(f()) as Box<dyn Any>);
        let id = rt.spawn(self.name, self.stack_size, self.detached, start)?;
        Ok(JoinHandle {
            id,
            joinable: !self.detached,
            _result: PhantomData,
        })
    }
}

pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// Owned permission to join a thread. Dropping it detaches the thread.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: ThreadId,
    joinable: bool,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Wait for the thread and take its result. A thread that left through
    /// [`exit`] with a value of another type reports `InvalidArgument`.
    pub fn join(mut self) -> Result<T> {
        self.joinable = false;
        let value = join_id(self.id)?;
        value
            .downcast::<T>()
            .map(|v| *v)
            .map_err(|_| ThreadError::InvalidArgument("thread exited with a value of another type"))
    }

    pub fn detach(mut self) -> Result<()> {
        self.joinable = false;
        detach(self.id)
    }

    /// Give up the handle without detaching; the thread must later be
    /// joined or detached by id.
    #[must_use]
    pub fn into_id(mut self) -> ThreadId {
        self.joinable = false;
        self.id
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.joinable {
            let _ = detach(self.id);
        }
    }
}

/// Join by id, returning the thread's type-erased result.
pub fn join_id(id: ThreadId) -> Result<Box<dyn Any>> {
    match runtime()?.join(id)? {
        Outcome::Finished(value) => Ok(value),
        Outcome::Canceled => Err(ThreadError::Canceled),
        Outcome::Panicked(msg) => Err(ThreadError::Panicked(msg)),
    }
}

pub fn detach(id: ThreadId) -> Result<()> {
    runtime()?.detach(id)
}

pub fn current() -> Result<ThreadId> {
    Ok(runtime()?.current_id())
}

/// Give every other ready thread a turn. A cancellation point.
pub fn yield_now() -> Result<()> {
    runtime()?.yield_now();
    Ok(())
}

/// Sleep for at least `duration`. A cancellation point. A duration past the
/// end of the clock sleeps until canceled.
pub fn sleep(duration: Duration) -> Result<()> {
    runtime()?.sleep_until(Instant::now().checked_add(duration));
    Ok(())
}

pub fn sleep_until(deadline: Instant) -> Result<()> {
    runtime()?.sleep_until(Some(deadline));
    Ok(())
}

/// End the calling thread with `value`, unwinding its stack. From the
/// initial thread, the runtime waits for every other thread and then `run`
/// returns [`ThreadError::InitialThreadExited`].
pub fn exit<T: Any>(value: T) -> ! {
    match runtime() {
        Ok(rt) => exit_current(rt, Box::new(value)),
        Err(_) => fatal("exit called outside a runtime"),
    }
}

pub fn cancel(id: ThreadId) -> Result<()> {
    runtime()?.cancel(id)
}

/// Deliver a pending cancellation, if any.
pub fn test_cancel() -> Result<()> {
    runtime()?.cancel_point();
    Ok(())
}

/// Enable or disable cancellation for the calling thread, returning the
/// previous setting.
pub fn set_cancel_enabled(on: bool) -> Result<bool> {
    Ok(runtime()?.set_cancel_enabled(on))
}

pub fn suspend(id: ThreadId) -> Result<()> {
    runtime()?.suspend(id)
}

pub fn resume(id: ThreadId) -> Result<()> {
    runtime()?.resume(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub state: ThreadState,
    pub name: Option<String>,
}

/// Snapshot of every thread the runtime still tracks, the dead-but-unjoined
/// included.
pub fn threads() -> Result<Vec<ThreadInfo>> {
    let rt = runtime()?;
    let st = rt.sched.lock();
    Ok(st
        .threads
        .iter()
        .map(|t| ThreadInfo {
            id: t.id,
            state: t.state,
            name: t.name.clone(),
        })
        .collect())
}

pub fn state_of(id: ThreadId) -> Result<ThreadState> {
    let rt = runtime()?;
    let st = rt.sched.lock();
    st.tcb(id).map(|t| t.state).ok_or(ThreadError::NoSuchThread)
}
