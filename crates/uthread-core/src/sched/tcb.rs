//! Thread control blocks and the arena that owns them.

use std::any::Any;
use std::fmt;
use std::time::Instant;

use super::state::{Link, ThreadState, WakeReason};
use crate::arch::{Context, MachineContext};
use crate::error::{Result, ThreadError};
use crate::errno;
use crate::signal::SigSet;
use crate::specific::SpecificValue;
use crate::stack::StackRegion;

/// Arena index plus a generation, so a recycled slot never aliases a stale id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

impl ThreadId {
    /// Pack into one word: generation high, index low.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

pub(crate) type StartFn = Box<dyn FnOnce() -> Box<dyn Any>>;

/// How a thread ended, as seen by its joiner.
pub(crate) enum Outcome {
    Finished(Box<dyn Any>),
    Canceled,
    Panicked(String),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CancelState {
    pub pending: bool,
    pub enabled: bool,
    /// Set once the unwind has started, so cleanup code can still block.
    pub delivering: bool,
}

impl Default for CancelState {
    fn default() -> Self {
        Self {
            pending: false,
            enabled: true,
            delivering: false,
        }
    }
}

pub(crate) struct Tcb {
    pub id: ThreadId,
    pub name: Option<String>,
    pub state: ThreadState,
    pub link: Link,
    pub context: Context,
    /// `None` for the initial thread, which runs on the process stack.
    pub stack: Option<StackRegion>,
    pub sigmask: SigSet,
    pub cancel: CancelState,
    pub detached: bool,
    pub joiner: Option<ThreadId>,
    pub wake: Option<WakeReason>,
    /// Armed deadline and its tie-break sequence number.
    pub timer: Option<(Instant, u64)>,
    pub suspend_pending: bool,
    pub start: Option<StartFn>,
    pub outcome: Option<Outcome>,
    pub pending_exit: Option<Box<dyn Any>>,
    pub specific: Vec<Option<SpecificValue>>,
}

impl Tcb {
    pub fn initial(id: ThreadId, sigmask: SigSet) -> Self {
        Self::with_parts(id, Some("main".to_string()), ThreadState::Running, Context::empty(), None, sigmask)
    }

    pub fn spawned(
        id: ThreadId,
        name: Option<String>,
        context: Context,
        stack: StackRegion,
        sigmask: SigSet,
        detached: bool,
        start: StartFn,
    ) -> Self {
        let mut tcb = Self::with_parts(id, name, ThreadState::Ready, context, Some(stack), sigmask);
        tcb.detached = detached;
        tcb.start = Some(start);
        tcb
    }

    fn with_parts(
        id: ThreadId,
        name: Option<String>,
        state: ThreadState,
        context: Context,
        stack: Option<StackRegion>,
        sigmask: SigSet,
    ) -> Self {
        Self {
            id,
            name,
            state,
            link: Link::Unlinked,
            context,
            stack,
            sigmask,
            cancel: CancelState::default(),
            detached: false,
            joiner: None,
            wake: None,
            timer: None,
            suspend_pending: false,
            start: None,
            outcome: None,
            pending_exit: None,
            specific: Vec::new(),
        }
    }
}

struct Slot {
    generation: u32,
    tcb: Option<Box<Tcb>>,
}

/// Arena of boxed TCBs. Boxing keeps each saved context at a stable
/// address while the arena grows.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Registry {
    pub fn insert(&mut self, make: impl FnOnce(ThreadId) -> Tcb) -> Result<ThreadId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| ThreadError::ResourceExhausted(errno::EAGAIN))?;
                self.slots.push(Slot {
                    generation: 1,
                    tcb: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ThreadId {
            index,
            generation: slot.generation,
        };
        slot.tcb = Some(Box::new(make(id)));
        Ok(id)
    }

    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.tcb.as_deref()
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.tcb.as_deref_mut()
    }

    /// Take the TCB out and retire its id.
    pub fn remove(&mut self, id: ThreadId) -> Option<Box<Tcb>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let tcb = slot.tcb.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index);
        Some(tcb)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().filter_map(|s| s.tcb.as_deref())
    }

    /// Remove every TCB except `keep`.
    pub fn drain_except(&mut self, keep: ThreadId) -> Vec<Box<Tcb>> {
        let ids: Vec<ThreadId> = self.iter().map(|t| t.id).filter(|&id| id != keep).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}
