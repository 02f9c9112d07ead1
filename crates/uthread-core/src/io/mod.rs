//! Blocking-I/O multiplexer.

mod fd;
mod ops;
mod poller;
mod sockaddr;

pub(crate) use fd::FdTable;
pub use ops::{
    accept, close, connect, dup2, pipe, read, read_timeout, read_until, set_nonblocking, write,
    write_all, write_timeout, write_until,
};
pub use poller::{Interest, PollRequest, Poller, SysPoller};
pub use sockaddr::SockAddr;
