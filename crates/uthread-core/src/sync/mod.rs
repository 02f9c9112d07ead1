//! Synchronization primitives built on the scheduler: mutex, condition
//! variable and once-control.

mod cond;
mod contract;
mod mutex;
mod once;

pub use cond::Condvar;
pub use contract::{MutexKind, MutexOp, MutexPhase, Transition, transition};
pub use mutex::{Mutex, MutexGuard};
pub use once::Once;
