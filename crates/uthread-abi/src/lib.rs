// Every export takes raw pointers from C callers and checks them for null
// itself, so per-function safety sections would only repeat that.
#![allow(clippy::missing_safety_doc)]
//! # uthread-abi
//!
//! C boundary for the uthread runtime. The crate builds a `cdylib` exposing
//! `uthread_*` symbols that mirror the shape of their POSIX counterparts:
//!
//! ```text
//! C caller -> uthread_* entry (this crate) -> uthread-core -> errno-style return
//! ```
//!
//! Thread-control functions return `0` or an errno value. I/O functions
//! return `-1` and set `errno`. Functions that can deliver a cancellation
//! use the `C-unwind` ABI, since delivery unwinds the calling thread.
//!
//! Primitive objects (`uthread_mutex_t`, `uthread_cond_t`, `uthread_once_t`)
//! are one-word handles to heap objects owned by this crate. A zeroed handle
//! is "not initialized" and is refused with `EINVAL`, except `uthread_once_t`,
//! whose zero value is the static initializer.

#[macro_use]
mod macros;

pub mod errno_abi;
pub mod io_abi;
pub mod signal_abi;
pub mod specific_abi;
pub mod sync_abi;
pub mod thread_abi;

use std::ffi::c_int;

use uthread_core::Result;

/// Collapse a core result into the errno-style return of thread-control
/// functions.
pub(crate) fn status(r: Result<()>) -> c_int {
    match r {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}
