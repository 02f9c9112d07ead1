//! Per-kernel-thread runtime: entry, parking, exit and teardown.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::scheduler::SchedState;
use super::state::{Link, ThreadState, WakeReason};
use super::tcb::{Outcome, StartFn, Tcb, ThreadId};
use crate::arch::{Context, MachineContext};
use crate::atomic_lock::{SpinGuard, SpinLock};
use crate::config::{self, RuntimeConfig};
use crate::error::{Result, ThreadError, fatal, violation};
use crate::io::{FdTable, Poller, SysPoller};
use crate::signal::{self, SigSet};
use crate::specific::{self, KeyTable};
use crate::stack::StackRegion;
use crate::trace::{self, TraceKind};

thread_local! {
    static CURRENT: Cell<*const Runtime> = const { Cell::new(std::ptr::null()) };
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);
static PROCESS_INIT: Once = Once::new();

/// Unwind payload carrying `exit`.
pub(crate) struct ExitMarker;
/// Unwind payload carrying a delivered cancellation.
pub(crate) struct CancelMarker;

/// Lock order: primitive-internal locks, then `fds`, then `keys`, then `sched`.
pub(crate) struct Runtime {
    pub id: u64,
    pub config: RuntimeConfig,
    pub sched: SpinLock<SchedState>,
    pub fds: SpinLock<FdTable>,
    pub keys: SpinLock<KeyTable>,
    entry_mask: SigSet,
}

/// The runtime active on this kernel thread.
pub(crate) fn runtime() -> Result<&'static Runtime> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return Err(ThreadError::NoRuntime);
    }
    // SAFETY: the pointer is published by `run_with_poller` for exactly as
    // long as the boxed runtime lives, and green threads only execute while
    // it is on this kernel thread's stack.
    Ok(unsafe { &*ptr })
}

fn process_init() {
    let _ = crate::stack::page_size();
    let _ = config::env_violation_policy();
}

/// Run `f` as the initial thread of a new runtime with default settings.
pub fn run<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    run_with(RuntimeConfig::default(), f)
}

pub fn run_with<F, T>(config: RuntimeConfig, f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    run_with_poller(config, Box::new(SysPoller::new()), f)
}

/// Enter a runtime on the calling kernel thread, which becomes its initial
/// thread. When `f` returns, threads still alive are abandoned as at process
/// exit. If the initial thread calls [`exit`](crate::exit) or is canceled,
/// every other thread is awaited first and the matching error is returned.
pub fn run_with_poller<F, T>(config: RuntimeConfig, poller: Box<dyn Poller>, f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    config.validate()?;
    PROCESS_INIT.call_once(process_init);
    if !CURRENT.with(Cell::get).is_null() {
        return Err(ThreadError::Busy);
    }

    let rt = Box::new(Runtime::new(config, poller)?);
    CURRENT.with(|c| c.set(&*rt));
    config::set_active_policy(Some(rt.config.violations));
    rt.trace(TraceKind::RuntimeStart, || "enter".to_string());

    let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) if payload.is::<ExitMarker>() => {
            rt.drain();
            Err(ThreadError::InitialThreadExited)
        }
        Err(payload) if payload.is::<CancelMarker>() => {
            rt.drain();
            Err(ThreadError::Canceled)
        }
        Err(payload) => {
            rt.shutdown();
            panic::resume_unwind(payload);
        }
    };
    rt.shutdown();
    result
}

impl Runtime {
    fn new(config: RuntimeConfig, poller: Box<dyn Poller>) -> Result<Self> {
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let entry_mask = SigSet::current()?;
        let sched = SchedState::new(id, config.trace, poller, entry_mask);
        Ok(Self {
            id,
            config,
            sched: SpinLock::new(sched),
            fds: SpinLock::new(FdTable::for_runtime(id)),
            keys: SpinLock::new(KeyTable::default()),
            entry_mask,
        })
    }

    pub fn trace(&self, kind: TraceKind, detail: impl FnOnce() -> String) {
        if self.config.trace {
            let me = self.sched.lock().current;
            trace::record(self.id, me.as_u64(), kind, detail());
        }
    }

    pub fn current_id(&self) -> ThreadId {
        self.sched.lock().current
    }

    /// Report misuse by the running thread.
    pub fn violation(&self, err: ThreadError, what: &'static str) -> ThreadError {
        let me = self.current_id();
        violation(self.id, me.as_u64(), err, what)
    }

    // -----------------------------------------------------------------------
    // Parking
    // -----------------------------------------------------------------------

    /// Block the running thread in `state` and switch to the next ready one.
    /// The caller links itself through `link` while still holding `st`, so
    /// registering and sleeping happen as one step. Returns why it woke.
    pub fn park(
        &self,
        mut st: SpinGuard<'_, SchedState>,
        state: ThreadState,
        link: Link,
        deadline: Option<Instant>,
    ) -> WakeReason {
        let me = st.current;
        st.block_current(state, link, deadline);
        trace::count_park();
        st.trace(me, TraceKind::Park, || state.as_str().to_string());
        self.switch_away(st, me);
        let mut st = self.sched.lock();
        st.current_tcb().wake.take().unwrap_or(WakeReason::Scheduled)
    }

    fn switch_away(&self, mut st: SpinGuard<'_, SchedState>, me: ThreadId) {
        let next = st.select_next();
        if next == me {
            drop(st);
            self.after_switch();
            return;
        }
        let save = st.context_ptr(me);
        let restore = st.context_ptr(next);
        trace::count_switch();
        st.trace(next, TraceKind::Switch, || format!("from {me}"));
        drop(st);
        // SAFETY: both contexts live in boxed TCBs that outlive the switch:
        // `me` is running and `next` was just taken off the ready queue.
        unsafe { Context::switch(save, restore) };
        self.after_switch();
    }

    /// First thing a thread does once it is running again.
    pub fn after_switch(&self) {
        let zombies = std::mem::take(&mut self.sched.lock().zombies);
        drop(zombies);
    }

    pub fn yield_now(&self) {
        self.cancel_point();
        let st = self.sched.lock();
        let _ = self.park(st, ThreadState::Ready, Link::Ready, None);
        self.cancel_point();
    }

    /// Sleep until `deadline`; with none, only cancellation ends the sleep.
    pub fn sleep_until(&self, deadline: Option<Instant>) {
        self.cancel_point();
        let st = self.sched.lock();
        if self.park(st, ThreadState::Sleeping, Link::Sleep, deadline) == WakeReason::Canceled {
            self.cancel_point();
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Deliver a pending cancellation by unwinding the running thread.
    pub fn cancel_point(&self) {
        let deliver = {
            let mut st = self.sched.lock();
            let cancel = &mut st.current_tcb().cancel;
            let now = cancel.pending && cancel.enabled && !cancel.delivering;
            if now {
                cancel.delivering = true;
            }
            now
        };
        if deliver {
            self.trace(TraceKind::Cancel, || "delivered".to_string());
            panic::resume_unwind(Box::new(CancelMarker));
        }
    }

    pub fn cancel(&self, target: ThreadId) -> Result<()> {
        let mut st = self.sched.lock();
        let tcb = st.tcb_mut(target).ok_or(ThreadError::NoSuchThread)?;
        if tcb.state == ThreadState::Dead {
            return Ok(());
        }
        tcb.cancel.pending = true;
        let interrupt = tcb.cancel.enabled && tcb.link.is_cancel_point(tcb.state);
        st.trace(target, TraceKind::Cancel, || "requested".to_string());
        if interrupt {
            st.wake(target, WakeReason::Canceled);
        }
        Ok(())
    }

    pub fn set_cancel_enabled(&self, on: bool) -> bool {
        let mut st = self.sched.lock();
        std::mem::replace(&mut st.current_tcb().cancel.enabled, on)
    }

    // -----------------------------------------------------------------------
    // Suspend / resume
    // -----------------------------------------------------------------------

    pub fn suspend(&self, target: ThreadId) -> Result<()> {
        let mut st = self.sched.lock();
        let me = st.current;
        let state = st.tcb(target).ok_or(ThreadError::NoSuchThread)?.state;
        st.trace(target, TraceKind::Suspend, || state.as_str().to_string());
        match state {
            ThreadState::Dead => Err(ThreadError::NoSuchThread),
            ThreadState::Suspended => Ok(()),
            ThreadState::Running if target == me => {
                let _ = self.park(st, ThreadState::Suspended, Link::Unlinked, None);
                Ok(())
            }
            ThreadState::Ready => {
                st.unlink(target);
                st.set_state(target, ThreadState::Suspended);
                Ok(())
            }
            _ => {
                if let Some(tcb) = st.tcb_mut(target) {
                    tcb.suspend_pending = true;
                }
                Ok(())
            }
        }
    }

    pub fn resume(&self, target: ThreadId) -> Result<()> {
        let mut st = self.sched.lock();
        let tcb = st.tcb_mut(target).ok_or(ThreadError::NoSuchThread)?;
        match tcb.state {
            ThreadState::Dead => Err(ThreadError::NoSuchThread),
            ThreadState::Suspended => {
                if tcb.wake.is_none() {
                    tcb.wake = Some(WakeReason::Resumed);
                }
                st.make_ready(target);
                Ok(())
            }
            _ => {
                tcb.suspend_pending = false;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn spawn(
        &self,
        name: Option<String>,
        stack_size: Option<usize>,
        detached: bool,
        start: StartFn,
    ) -> Result<ThreadId> {
        let size = stack_size.unwrap_or(self.config.stack_size);
        config::check_stack_size(size)?;
        let stack = StackRegion::allocate(size, self.config.guard_size)?;
        let context = Context::init(stack.bounds(), thread_entry)?;

        let mut st = self.sched.lock();
        let sigmask = st.current_tcb().sigmask;
        let id = st
            .threads
            .insert(|id| Tcb::spawned(id, name, context, stack, sigmask, detached, start))?;
        st.live += 1;
        st.enqueue_new(id);
        trace::count_spawn();
        st.trace(id, TraceKind::Spawn, || format!("stack {size}"));
        Ok(id)
    }

    pub fn join(&self, target: ThreadId) -> Result<Outcome> {
        self.cancel_point();
        loop {
            let mut st = self.sched.lock();
            let me = st.current;
            if target == me {
                drop(st);
                return Err(self.violation(ThreadError::Deadlock, "join"));
            }
            let tcb = st.tcb_mut(target).ok_or(ThreadError::NoSuchThread)?;
            if tcb.detached || tcb.joiner.is_some_and(|j| j != me) {
                drop(st);
                return Err(self.violation(ThreadError::NotJoinable, "join"));
            }
            if tcb.state == ThreadState::Dead {
                let mut dead = match st.threads.remove(target) {
                    Some(dead) => dead,
                    None => fatal("dead thread vanished before join"),
                };
                st.trace(target, TraceKind::Join, || format!("by {me}"));
                drop(st);
                let outcome = dead.outcome.take();
                drop(dead);
                return outcome.ok_or(ThreadError::NoSuchThread);
            }
            tcb.joiner = Some(me);
            if self.park(st, ThreadState::BlockedOnJoin, Link::Join(target), None)
                == WakeReason::Canceled
            {
                if let Some(t) = self.sched.lock().tcb_mut(target) {
                    t.joiner = None;
                }
                self.cancel_point();
            }
        }
    }

    pub fn detach(&self, target: ThreadId) -> Result<()> {
        let mut st = self.sched.lock();
        let tcb = st.tcb_mut(target).ok_or(ThreadError::NoSuchThread)?;
        if tcb.detached || tcb.joiner.is_some() {
            drop(st);
            return Err(self.violation(ThreadError::NotJoinable, "detach"));
        }
        tcb.detached = true;
        if tcb.state == ThreadState::Dead {
            let dead = st.threads.remove(target);
            drop(st);
            drop(dead);
        }
        Ok(())
    }

    fn run_start(&self) -> Outcome {
        let (start, cancel_now) = {
            let mut st = self.sched.lock();
            let tcb = st.current_tcb();
            (tcb.start.take(), tcb.cancel.pending && tcb.cancel.enabled)
        };
        let Some(start) = start else {
            fatal("thread entry ran twice");
        };
        if cancel_now {
            drop(start);
            return Outcome::Canceled;
        }
        match panic::catch_unwind(AssertUnwindSafe(start)) {
            Ok(value) => Outcome::Finished(value),
            Err(payload) => self.classify_unwind(payload),
        }
    }

    fn classify_unwind(&self, payload: Box<dyn Any + Send>) -> Outcome {
        if payload.is::<ExitMarker>() {
            let value = self.sched.lock().current_tcb().pending_exit.take();
            Outcome::Finished(value.unwrap_or_else(|| Box::new(())))
        } else if payload.is::<CancelMarker>() {
            Outcome::Canceled
        } else {
            Outcome::Panicked(panic_message(payload.as_ref()))
        }
    }

    /// Mark the running thread dead and switch away for good.
    fn finish_current(&self, outcome: Outcome) -> ! {
        let mut st = self.sched.lock();
        let me = st.current;
        let (joiner, detached) = {
            let tcb = st.current_tcb();
            tcb.outcome = Some(outcome);
            (tcb.joiner, tcb.detached)
        };
        st.set_state(me, ThreadState::Dead);
        st.live -= 1;
        st.trace(me, TraceKind::Exit, || if detached { "detached" } else { "joinable" }.to_string());
        if let Some(j) = joiner {
            st.wake(j, WakeReason::Joined);
        }
        if st.live == 1 {
            if let Some(w) = st.drain_waiter {
                st.wake(w, WakeReason::Drained);
            }
        }

        // A detached thread cannot free the stack it is running on; the next
        // thread to run does it from `after_switch`.
        let save: *mut Context = if detached {
            let Some(mut tcb) = st.threads.remove(me) else {
                fatal("running thread missing from registry");
            };
            let ptr: *mut Context = &mut tcb.context;
            st.zombies.push(tcb);
            ptr
        } else {
            st.context_ptr(me)
        };
        let next = st.select_next();
        let restore = st.context_ptr(next);
        trace::count_switch();
        drop(st);
        // SAFETY: `save` points into a boxed TCB kept alive by the registry or
        // the zombie list until the next thread runs `after_switch`.
        unsafe { Context::switch(save, restore) };
        fatal("dead thread was resumed")
    }

    /// Initial thread left through `exit` or cancellation: wait for the rest.
    fn drain(&self) {
        specific::run_destructors(self);
        loop {
            let st = self.sched.lock();
            if st.live <= 1 {
                return;
            }
            let _ = self.park(st, ThreadState::BlockedOnJoin, Link::Drain, None);
        }
    }

    /// Abandon whatever is still alive and restore process state.
    fn shutdown(&self) {
        let (tcbs, zombies) = {
            let mut st = self.sched.lock();
            let initial = st.initial;
            let tcbs = st.threads.drain_except(initial);
            (tcbs, std::mem::take(&mut st.zombies))
        };
        CURRENT.with(|c| c.set(std::ptr::null()));
        config::set_active_policy(None);

        let mut abandoned = 0usize;
        for mut tcb in tcbs {
            if tcb.state != ThreadState::Dead {
                abandoned += 1;
                // Never resumed, so its thread-specific destructors never run.
                std::mem::forget(std::mem::take(&mut tcb.specific));
            }
            drop(tcb);
        }
        drop(zombies);

        self.fds.lock().restore_all();
        signal::install(&self.entry_mask);
        if self.config.trace || abandoned > 0 {
            trace::record(self.id, 0, TraceKind::Abandon, format!("{abandoned} threads"));
        }
        if self.config.trace {
            trace::record(self.id, 0, TraceKind::RuntimeStop, "exit");
        }
    }
}

/// Exit the calling thread with `value`, unwinding its stack.
pub(crate) fn exit_current(rt: &Runtime, value: Box<dyn Any>) -> ! {
    rt.sched.lock().current_tcb().pending_exit = Some(value);
    panic::resume_unwind(Box::new(ExitMarker))
}

extern "C" fn thread_entry() -> ! {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(_) => fatal("green thread started outside its runtime"),
    };
    rt.after_switch();
    let outcome = rt.run_start();
    specific::run_destructors(rt);
    rt.finish_current(outcome)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_runtime_outside_run() {
        assert!(matches!(runtime(), Err(ThreadError::NoRuntime)));
    }

    #[test]
    fn nested_entry_is_busy() {
        let inner = run(|| run(|| 1)).unwrap();
        assert_eq!(inner, Err(ThreadError::Busy));
    }

    #[test]
    fn runtime_returns_closure_value_and_clears_itself() {
        assert_eq!(run(|| 42), Ok(42));
        assert!(runtime().is_err());
        assert_eq!(run(|| 7), Ok(7));
    }

    #[test]
    fn panic_in_initial_thread_propagates() {
        let caught = panic::catch_unwind(|| run(|| -> u32 { panic!("boom") }));
        assert!(caught.is_err());
        assert!(runtime().is_err());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }
}
