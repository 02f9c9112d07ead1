//! Ready queue, wait queues, timers and the idle poll.
//!
//! Every queue a thread can sit in lives here, keyed centrally, so the
//! "linked into at most one structure" rule is checked in one place: a
//! thread's [`Link`] names the structure, and linking an already-linked
//! thread is fatal.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::state::{Link, ThreadState, WaitKey, WakeReason};
use super::tcb::{Registry, Tcb, ThreadId};
use crate::arch::Context;
use crate::errno;
use crate::error::fatal;
use crate::io::{Interest, PollRequest, Poller};
use crate::signal::{self, SigSet};
use crate::trace::{self, TraceKind};

struct IoWaiter {
    tid: ThreadId,
    fd: RawFd,
    interest: Interest,
}

pub(crate) struct SchedState {
    pub runtime: u64,
    pub tracing: bool,
    pub threads: Registry,
    pub current: ThreadId,
    pub initial: ThreadId,
    /// Threads still alive, the initial thread included.
    pub live: usize,
    /// Initial thread waiting for everyone else to finish.
    pub drain_waiter: Option<ThreadId>,
    /// Detached threads that died; freed by whoever runs next.
    pub zombies: Vec<Box<Tcb>>,
    ready: VecDeque<ThreadId>,
    waits: HashMap<WaitKey, VecDeque<ThreadId>>,
    timers: BTreeSet<(Instant, u64, ThreadId)>,
    timer_seq: u64,
    io_waits: Vec<IoWaiter>,
    poller: Box<dyn Poller>,
    installed_mask: SigSet,
}

impl SchedState {
    pub fn new(runtime: u64, tracing: bool, poller: Box<dyn Poller>, initial_mask: SigSet) -> Self {
        let mut threads = Registry::default();
        let initial = match threads.insert(|id| Tcb::initial(id, initial_mask)) {
            Ok(id) => id,
            Err(_) => fatal("cannot register the initial thread"),
        };
        Self {
            runtime,
            tracing,
            threads,
            current: initial,
            initial,
            live: 1,
            drain_waiter: None,
            zombies: Vec::new(),
            ready: VecDeque::new(),
            waits: HashMap::new(),
            timers: BTreeSet::new(),
            timer_seq: 0,
            io_waits: Vec::new(),
            poller,
            installed_mask: initial_mask,
        }
    }

    pub fn trace(&self, thread: ThreadId, kind: TraceKind, detail: impl FnOnce() -> String) {
        if self.tracing {
            trace::record(self.runtime, thread.as_u64(), kind, detail());
        }
    }

    pub fn tcb(&self, id: ThreadId) -> Option<&Tcb> {
        self.threads.get(id)
    }

    pub fn tcb_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        self.threads.get_mut(id)
    }

    fn expect_tcb(&mut self, id: ThreadId) -> &mut Tcb {
        match self.threads.get_mut(id) {
            Some(tcb) => tcb,
            None => fatal("scheduler referenced a thread that no longer exists"),
        }
    }

    pub fn current_tcb(&mut self) -> &mut Tcb {
        let me = self.current;
        self.expect_tcb(me)
    }

    pub fn context_ptr(&mut self, id: ThreadId) -> *mut Context {
        &mut self.expect_tcb(id).context
    }

    pub fn set_state(&mut self, id: ThreadId, next: ThreadState) {
        let tcb = self.expect_tcb(id);
        if !tcb.state.can_transition(next) {
            let msg = format!(
                "illegal transition {} -> {} for thread {id}",
                tcb.state.as_str(),
                next.as_str()
            );
            fatal(&msg);
        }
        tcb.state = next;
    }

    // -----------------------------------------------------------------------
    // Queue linkage
    // -----------------------------------------------------------------------

    /// Append a blocked or suspended thread to the ready queue.
    pub fn make_ready(&mut self, id: ThreadId) {
        let tcb = self.expect_tcb(id);
        if tcb.state == ThreadState::Dead {
            fatal("attempted to schedule a dead thread");
        }
        if tcb.link != Link::Unlinked {
            fatal("thread is already linked into a queue");
        }
        self.set_state(id, ThreadState::Ready);
        self.expect_tcb(id).link = Link::Ready;
        self.ready.push_back(id);
    }

    /// Queue a freshly created thread, which starts out `Ready`.
    pub fn enqueue_new(&mut self, id: ThreadId) {
        let tcb = self.expect_tcb(id);
        if tcb.state != ThreadState::Ready || tcb.link != Link::Unlinked {
            fatal("new thread queued twice");
        }
        tcb.link = Link::Ready;
        self.ready.push_back(id);
    }

    /// Move the running thread into `state`, linked at `link`.
    pub fn block_current(&mut self, state: ThreadState, link: Link, deadline: Option<Instant>) {
        let me = self.current;
        if self.expect_tcb(me).link != Link::Unlinked {
            fatal("running thread is linked into a queue");
        }
        self.set_state(me, state);
        match link {
            Link::Ready => self.ready.push_back(me),
            Link::Wait(key) => self.waits.entry(key).or_default().push_back(me),
            Link::Io(fd, interest) => self.io_waits.push(IoWaiter {
                tid: me,
                fd,
                interest,
            }),
            Link::Drain => self.drain_waiter = Some(me),
            Link::Join(_) | Link::Sleep | Link::Unlinked => {}
        }
        let tcb = self.expect_tcb(me);
        tcb.link = link;
        tcb.wake = None;
        if let Some(at) = deadline {
            self.arm_timer(me, at);
        }
    }

    pub fn unlink(&mut self, id: ThreadId) {
        let link = std::mem::replace(&mut self.expect_tcb(id).link, Link::Unlinked);
        match link {
            Link::Ready => self.ready.retain(|&t| t != id),
            Link::Wait(key) => {
                if let Some(q) = self.waits.get_mut(&key) {
                    q.retain(|&t| t != id);
                    if q.is_empty() {
                        self.waits.remove(&key);
                    }
                }
            }
            Link::Io(..) => self.io_waits.retain(|w| w.tid != id),
            Link::Drain => self.drain_waiter = None,
            Link::Join(_) | Link::Sleep | Link::Unlinked => {}
        }
    }

    /// Resume a parked thread for `reason`. A pending suspension turns the
    /// wakeup into `Suspended`; the reason is kept for the later resume.
    pub fn wake(&mut self, id: ThreadId, reason: WakeReason) {
        self.unlink(id);
        self.disarm_timer(id);
        let tcb = self.expect_tcb(id);
        tcb.wake = Some(reason);
        if tcb.suspend_pending {
            tcb.suspend_pending = false;
            self.set_state(id, ThreadState::Suspended);
        } else {
            self.make_ready(id);
        }
        self.trace(id, TraceKind::Wake, || format!("{reason:?}"));
    }

    /// Wake the head of `key`'s queue, if any.
    pub fn wake_first(&mut self, key: WaitKey, reason: WakeReason) -> Option<ThreadId> {
        let id = self.waits.get(&key)?.front().copied()?;
        self.wake(id, reason);
        Some(id)
    }

    /// Wake all of `key`'s queue in FIFO order.
    pub fn wake_all(&mut self, key: WaitKey, reason: WakeReason) -> usize {
        let ids: Vec<ThreadId> = self
            .waits
            .get(&key)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default();
        for &id in &ids {
            self.wake(id, reason);
        }
        ids.len()
    }

    pub fn waiter_count(&self, key: WaitKey) -> usize {
        self.waits.get(&key).map_or(0, VecDeque::len)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn arm_timer(&mut self, id: ThreadId, at: Instant) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        self.timers.insert((at, seq, id));
        self.expect_tcb(id).timer = Some((at, seq));
    }

    fn disarm_timer(&mut self, id: ThreadId) {
        if let Some((at, seq)) = self.expect_tcb(id).timer.take() {
            self.timers.remove(&(at, seq, id));
        }
    }

    fn expire_timers(&mut self, now: Instant) {
        while let Some(&(at, seq, id)) = self.timers.first() {
            if at > now {
                break;
            }
            self.timers.remove(&(at, seq, id));
            self.expect_tcb(id).timer = None;
            self.wake(id, WakeReason::TimedOut);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|&(at, _, _)| at)
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    fn poll_io(&mut self, timeout: Option<Duration>) {
        let mut requests: Vec<PollRequest> = self
            .io_waits
            .iter()
            .map(|w| PollRequest::new(w.fd, w.interest))
            .collect();
        trace::count_poll();
        match self.poller.poll(&mut requests, timeout) {
            Ok(_) => {}
            Err(e) if e == errno::EINTR => return,
            Err(e) => fatal(&format!("poll collaborator failed with errno {e}")),
        }
        let woken: Vec<ThreadId> = requests
            .iter()
            .zip(&self.io_waits)
            .filter(|(req, _)| req.ready)
            .map(|(_, w)| w.tid)
            .collect();
        if !woken.is_empty() {
            let me = self.current;
            self.trace(me, TraceKind::Poll, || format!("{} ready", woken.len()));
        }
        for id in woken {
            self.wake(id, WakeReason::IoReady);
        }
    }

    /// Pick the next thread to run and mark it `Running`.
    ///
    /// With runnable threads, descriptors are swept without waiting. With
    /// none, the whole kernel thread sleeps in the poll collaborator until a
    /// descriptor turns ready or the earliest deadline passes. If nothing
    /// could ever wake a thread, that is a deadlock and the process aborts.
    pub fn select_next(&mut self) -> ThreadId {
        loop {
            let now = Instant::now();
            self.expire_timers(now);
            let idle = self.ready.is_empty();
            if idle || !self.io_waits.is_empty() {
                let timeout = if !idle {
                    Some(Duration::ZERO)
                } else {
                    match self.next_deadline() {
                        Some(at) => Some(at.saturating_duration_since(now)),
                        None if self.io_waits.is_empty() => {
                            fatal("deadlock: every thread is blocked and nothing can wake one")
                        }
                        None => None,
                    }
                };
                self.poll_io(timeout);
            }
            if let Some(next) = self.ready.pop_front() {
                self.expect_tcb(next).link = Link::Unlinked;
                self.set_state(next, ThreadState::Running);
                self.current = next;
                self.install_mask_of(next);
                return next;
            }
        }
    }

    fn install_mask_of(&mut self, id: ThreadId) {
        let mask = self.expect_tcb(id).sigmask;
        if mask != self.installed_mask {
            signal::install(&mask);
            self.installed_mask = mask;
        }
    }

    /// Record a mask change already applied to the kernel.
    pub fn note_installed_mask(&mut self, mask: SigSet) {
        self.installed_mask = mask;
    }
}
