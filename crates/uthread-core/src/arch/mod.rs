//! Machine contexts.
//!
//! Each supported architecture provides a [`MachineContext`] implementation;
//! everything above this module works through the trait and never touches
//! registers directly. A context switch saves the running register state
//! into one context and resumes another in a single step, so `save` and
//! `restore` are the two halves of [`MachineContext::switch`].

use crate::error::{Result, ThreadError};
use crate::stack::StackBounds;

/// Entry point of a never-run context. It must not return.
pub type EntryFn = extern "C" fn() -> !;

pub trait MachineContext: Sized {
    /// Stack pointer alignment the ABI requires at a call boundary.
    const STACK_ALIGN: usize;
    /// Bytes reserved at the aligned stack top for the bootstrap frame.
    const BOOTSTRAP_FRAME: usize;

    /// A context that holds nothing yet; valid only as a save target.
    fn empty() -> Self;

    /// Context whose first resumption runs `entry` near the top of `stack`.
    fn init(stack: StackBounds, entry: EntryFn) -> Result<Self>;

    /// Save the current registers into `save` and resume `restore`.
    /// Returns when some later switch resumes `save`.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of the call. `restore`
    /// must come from [`MachineContext::init`] or an earlier save, and its
    /// stack must still be mapped.
    unsafe fn switch(save: *mut Self, restore: *const Self);

    /// Resume `ctx` without keeping the current state.
    ///
    /// # Safety
    ///
    /// Same as [`MachineContext::switch`] for `ctx`. Whatever runs on the
    /// current stack is abandoned.
    unsafe fn restore(ctx: *const Self) -> ! {
        let mut scratch = Self::empty();
        // SAFETY: forwarded from the caller; `scratch` is never resumed.
        unsafe { Self::switch(&mut scratch, ctx) };
        crate::error::fatal("abandoned context was resumed")
    }

    /// Saved stack pointer.
    fn stack_pointer(&self) -> usize;
}

/// Mask the stack top down to `align`, then reserve `frame` bytes.
#[must_use]
pub const fn initial_stack_pointer(high: usize, align: usize, frame: usize) -> usize {
    (high & !(align - 1)) - frame
}

/// Check that `stack` can hold the bootstrap frame and return the initial sp.
pub(crate) fn bootstrap_sp(stack: StackBounds, align: usize, frame: usize) -> Result<usize> {
    let need = frame + align;
    if stack.high <= stack.low || stack.size() < need {
        return Err(ThreadError::StackTooSmall {
            requested: stack.high.saturating_sub(stack.low),
            minimum: need,
        });
    }
    Ok(initial_stack_pointer(stack.high, align, frame))
}

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::Context;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::Context;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("uthread-core supports x86_64 and aarch64 only");
