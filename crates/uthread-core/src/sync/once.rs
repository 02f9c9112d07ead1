//! One-time initialization.

use std::cell::Cell;

use super::contract::MutexKind;
use super::mutex::Mutex;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnceState {
    NeedsInit,
    InProgress,
    Done,
}

/// Runs an initializer exactly once. Latecomers block on an error-checking
/// gate mutex until the first caller finishes; calling back into the same
/// `Once` from inside its initializer fails with `Deadlock`.
#[derive(Debug)]
pub struct Once {
    state: Cell<OnceState>,
    gate: Mutex,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts an unwinding initializer's `Once` back to `NeedsInit`.
struct Reset<'a> {
    once: &'a Once,
    armed: bool,
}

impl Drop for Reset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.once.state.set(OnceState::NeedsInit);
        }
        let _ = self.once.gate.unlock();
    }
}

impl Once {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Cell::new(OnceState::NeedsInit),
            gate: Mutex::new(MutexKind::ErrorCheck),
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.get() == OnceState::Done
    }

    pub fn call_once(&self, f: impl FnOnce()) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        self.gate.lock()?;
        let mut reset = Reset {
            once: self,
            armed: false,
        };
        if self.state.get() == OnceState::NeedsInit {
            self.state.set(OnceState::InProgress);
            reset.armed = true;
            f();
            self.state.set(OnceState::Done);
            reset.armed = false;
        }
        Ok(())
    }
}
