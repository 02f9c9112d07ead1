//! # uthread-core
//!
//! Cooperative green threads on one kernel thread.
//!
//! A runtime, entered with [`run`], multiplexes many threads of control over
//! the calling kernel thread. Threads switch only at well-defined points:
//! explicit yields, sleeps, mutex contention, condition waits, joins and the
//! blocking I/O wrappers in [`io`], which park only the calling thread while
//! the rest keep running. Unsafe code is confined to the modules that talk
//! to the machine or the kernel.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod arch;
#[allow(unsafe_code)]
pub mod atomic_lock;
pub mod config;
pub mod errno;
pub mod error;
#[allow(unsafe_code)]
pub mod io;
#[allow(unsafe_code)]
mod sched;
#[allow(unsafe_code)]
pub mod signal;
pub mod specific;
#[allow(unsafe_code)]
pub mod stack;
pub mod sync;
pub mod thread;
pub mod trace;

pub use config::{RuntimeConfig, ViolationPolicy};
pub use error::{Result, ThreadError};
pub use sched::{ThreadId, ThreadState, run, run_with, run_with_poller};
pub use specific::Key;
pub use sync::{Condvar, Mutex, MutexGuard, MutexKind, Once};
pub use thread::{
    Builder, JoinHandle, ThreadInfo, cancel, current, detach, exit, join_id, resume, set_cancel_enabled,
    sleep, sleep_until, spawn, state_of, suspend, test_cancel, threads, yield_now,
};
