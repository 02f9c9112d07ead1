//! Thread-specific data keys.
//!
//! A [`Key`] names one slot in every thread. Values are type-erased boxes
//! owned by the thread; dropping a value is its destructor. When a thread
//! ends, live values are dropped in rounds, because a destructor may store a
//! fresh value, up to [`DESTRUCTOR_ITERATIONS`] times. Values under a key
//! deleted in the meantime are leaked, never dropped.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::errno;
use crate::error::{Result, ThreadError};
use crate::sched::{Runtime, runtime};

pub const KEYS_MAX: usize = 256;
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Handle to a thread-specific slot in the current runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

pub(crate) struct SpecificValue {
    pub generation: u32,
    pub value: Box<dyn Any>,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeySlot {
    generation: u32,
    live: bool,
}

#[derive(Debug, Default)]
pub(crate) struct KeyTable {
    slots: Vec<KeySlot>,
    next_generation: u32,
}

impl KeyTable {
    fn create(&mut self) -> Result<Key> {
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let generation = self.next_generation;
        let index = match self.slots.iter().position(|s| !s.live) {
            Some(index) => index,
            None if self.slots.len() < KEYS_MAX => {
                self.slots.push(KeySlot::default());
                self.slots.len() - 1
            }
            None => return Err(ThreadError::ResourceExhausted(errno::EAGAIN)),
        };
        self.slots[index] = KeySlot {
            generation,
            live: true,
        };
        Ok(Key {
            index: index as u32,
            generation,
        })
    }

    fn is_live(&self, key: Key) -> bool {
        self.slots
            .get(key.index as usize)
            .is_some_and(|s| s.live && s.generation == key.generation)
    }

    fn delete(&mut self, key: Key) -> bool {
        if !self.is_live(key) {
            return false;
        }
        self.slots[key.index as usize].live = false;
        true
    }

    /// Generation of each live slot, by index.
    fn live_generations(&self) -> Vec<Option<u32>> {
        self.slots.iter().map(|s| s.live.then_some(s.generation)).collect()
    }
}

impl Key {
    /// Pack into one word for the C surface: generation high, index low.
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

    /// Allocate a key. Fails with `EAGAIN` once [`KEYS_MAX`] keys are live.
    pub fn create() -> Result<Self> {
        runtime()?.keys.lock().create()
    }

    /// Retire the key. Values still stored under it are not dropped.
    pub fn delete(self) -> Result<()> {
        let rt = runtime()?;
        if rt.keys.lock().delete(self) {
            Ok(())
        } else {
            Err(rt.violation(ThreadError::InvalidArgument("key is not live"), "key_delete"))
        }
    }

    /// Store `value` for the calling thread, returning what was there.
    pub fn replace<T: Any>(self, value: T) -> Result<Option<Box<dyn Any>>> {
        self.put(Some(Box::new(value)))
    }

    /// Store `value`, dropping any previous value after the runtime is
    /// unlocked.
    pub fn set<T: Any>(self, value: T) -> Result<()> {
        drop(self.replace(value)?);
        Ok(())
    }

    pub fn take(self) -> Result<Option<Box<dyn Any>>> {
        self.put(None)
    }

    /// Run `f` on the calling thread's value, if it holds a `T`.
    pub fn with<T: Any, R>(self, f: impl FnOnce(Option<&T>) -> R) -> Result<R> {
        let held = self.take()?;
        let out = f(held.as_deref().and_then(|v| v.downcast_ref::<T>()));
        if let Some(value) = held {
            // `f` may have stored a new value; that one wins.
            let rt = runtime()?;
            let mut st = rt.sched.lock();
            let slot = slot_mut(&mut st.current_tcb().specific, self.index as usize);
            if slot.is_none() {
                *slot = Some(SpecificValue {
                    generation: self.generation,
                    value,
                });
            } else {
                drop(st);
                drop(value);
            }
        }
        Ok(out)
    }

    pub fn get<T: Any + Clone>(self) -> Result<Option<T>> {
        self.with(|v: Option<&T>| v.cloned())
    }

    fn put(self, value: Option<Box<dyn Any>>) -> Result<Option<Box<dyn Any>>> {
        let rt = runtime()?;
        let keys = rt.keys.lock();
        if !keys.is_live(self) {
            drop(keys);
            return Err(rt.violation(ThreadError::InvalidArgument("key is not live"), "key_set"));
        }
        let mut st = rt.sched.lock();
        drop(keys);
        let slot = slot_mut(&mut st.current_tcb().specific, self.index as usize);
        let old = std::mem::replace(
            slot,
            value.map(|value| SpecificValue {
                generation: self.generation,
                value,
            }),
        );
        drop(st);
        Ok(match old {
            Some(old) if old.generation == self.generation => Some(old.value),
            Some(stale) => {
                std::mem::forget(stale);
                None
            }
            None => None,
        })
    }
}

fn slot_mut(values: &mut Vec<Option<SpecificValue>>, index: usize) -> &mut Option<SpecificValue> {
    if values.len() <= index {
        values.resize_with(index + 1, || None);
    }
    &mut values[index]
}

/// Drop the calling thread's values in rounds. Runs with cancellation
/// disabled; a panicking destructor is swallowed.
pub(crate) fn run_destructors(rt: &Runtime) {
    let was_enabled = rt.set_cancel_enabled(false);
    for _ in 0..DESTRUCTOR_ITERATIONS {
        let live = rt.keys.lock().live_generations();
        let values = std::mem::take(&mut rt.sched.lock().current_tcb().specific);
        let mut pending = Vec::new();
        for (index, slot) in values.into_iter().enumerate() {
            let Some(value) = slot else { continue };
            if live.get(index).copied().flatten() == Some(value.generation) {
                pending.push(value);
            } else {
                std::mem::forget(value);
            }
        }
        if pending.is_empty() {
            break;
        }
        for value in pending {
            let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(value)));
        }
    }
    let leftover = std::mem::take(&mut rt.sched.lock().current_tcb().specific);
    std::mem::forget(leftover);
    rt.set_cancel_enabled(was_enabled);
}
