//! Scheduler event trace and counters.
//!
//! Events go into a bounded process-wide ring; each runtime decides whether
//! it records (see [`RuntimeConfig::trace`](crate::config::RuntimeConfig)).
//! Violations and fatal errors are always recorded. Counters are always on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Ring capacity; the oldest events are dropped first.
pub const TRACE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    RuntimeStart,
    RuntimeStop,
    Spawn,
    Switch,
    Park,
    Wake,
    Handoff,
    Exit,
    Join,
    Cancel,
    Suspend,
    Poll,
    Revoke,
    Abandon,
    Violation,
    Fatal,
}

impl TraceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeStart => "runtime_start",
            Self::RuntimeStop => "runtime_stop",
            Self::Spawn => "spawn",
            Self::Switch => "switch",
            Self::Park => "park",
            Self::Wake => "wake",
            Self::Handoff => "handoff",
            Self::Exit => "exit",
            Self::Join => "join",
            Self::Cancel => "cancel",
            Self::Suspend => "suspend",
            Self::Poll => "poll",
            Self::Revoke => "revoke",
            Self::Abandon => "abandon",
            Self::Violation => "violation",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub seq: u64,
    /// Runtime id, 0 when raised outside any runtime.
    pub runtime: u64,
    /// Packed [`ThreadId`](crate::ThreadId), 0 when not thread-specific.
    pub thread: u64,
    pub kind: TraceKind,
    pub detail: String,
}

struct Ring {
    next_seq: u64,
    events: VecDeque<TraceEvent>,
}

static RING: Mutex<Ring> = parking_lot::const_mutex(Ring {
    next_seq: 1,
    events: VecDeque::new(),
});

impl Ring {
    fn push(&mut self, capacity: usize, runtime: u64, thread: u64, kind: TraceKind, detail: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.events.len() == capacity {
            self.events.pop_front();
        }
        self.events.push_back(TraceEvent {
            seq,
            runtime,
            thread,
            kind,
            detail,
        });
    }
}

pub(crate) fn record(runtime: u64, thread: u64, kind: TraceKind, detail: impl Into<String>) {
    RING.lock()
        .push(TRACE_CAPACITY, runtime, thread, kind, detail.into());
}

/// Copy of the ring, oldest first.
#[must_use]
pub fn snapshot() -> Vec<TraceEvent> {
    RING.lock().events.iter().cloned().collect()
}

/// Events of one runtime, oldest first.
#[must_use]
pub fn events_for(runtime: u64) -> Vec<TraceEvent> {
    RING.lock()
        .events
        .iter()
        .filter(|e| e.runtime == runtime)
        .cloned()
        .collect()
}

/// Remove and return every buffered event.
pub fn drain() -> Vec<TraceEvent> {
    RING.lock().events.drain(..).collect()
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

static SPAWNS: AtomicU64 = AtomicU64::new(0);
static SWITCHES: AtomicU64 = AtomicU64::new(0);
static PARKS: AtomicU64 = AtomicU64::new(0);
static POLLS: AtomicU64 = AtomicU64::new(0);
static HANDOFFS: AtomicU64 = AtomicU64::new(0);
static VIOLATIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub spawns: u64,
    pub switches: u64,
    pub parks: u64,
    pub polls: u64,
    pub handoffs: u64,
    pub violations: u64,
}

#[must_use]
pub fn counters() -> Counters {
    Counters {
        spawns: SPAWNS.load(Ordering::Relaxed),
        switches: SWITCHES.load(Ordering::Relaxed),
        parks: PARKS.load(Ordering::Relaxed),
        polls: POLLS.load(Ordering::Relaxed),
        handoffs: HANDOFFS.load(Ordering::Relaxed),
        violations: VIOLATIONS.load(Ordering::Relaxed),
    }
}

/// Test-only reset hook.
pub fn reset_counters() {
    for c in [&SPAWNS, &SWITCHES, &PARKS, &POLLS, &HANDOFFS, &VIOLATIONS] {
        c.store(0, Ordering::Relaxed);
    }
}

pub(crate) fn count_spawn() {
    SPAWNS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_switch() {
    SWITCHES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_park() {
    PARKS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_poll() {
    POLLS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_handoff() {
    HANDOFFS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_violation() {
    VIOLATIONS.fetch_add(1, Ordering::Relaxed);
}
