//! Scheduler: thread control blocks, the ready and wait queues, and the
//! runtime that drives context switches between them.

mod runtime;
mod scheduler;
mod state;
mod tcb;

pub use runtime::{run, run_with, run_with_poller};
pub use state::ThreadState;
pub use tcb::ThreadId;

pub(crate) use runtime::{Runtime, exit_current, runtime};
pub(crate) use scheduler::SchedState;
pub(crate) use state::{Link, WaitKey, WakeReason};
pub(crate) use tcb::Outcome;
