//! Thread-blocking wrappers for system calls that may block.
//!
//! Each wrapper claims the descriptor for its direction, which forces
//! `O_NONBLOCK` for the duration, then retries the call until it stops
//! reporting "would block", parking the calling green thread in the poll set
//! in between. Every other error comes back unchanged. If the user put the
//! descriptor in non-blocking mode themselves, the call is made once and
//! `EAGAIN` is theirs to see.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::fd::{self, FdClaim};
use super::{Interest, SockAddr};
use crate::errno;
use crate::error::{Result, ThreadError};
use crate::sched::{Link, Runtime, ThreadState, WakeReason, runtime};

fn sys_result(rc: isize) -> std::result::Result<usize, i32> {
    if rc < 0 { Err(errno::last()) } else { Ok(rc as usize) }
}

/// Park until `fd` is ready for `interest`. Returns the error that ends the
/// wait, if any.
fn wait_ready(rt: &Runtime, fd: RawFd, interest: Interest, deadline: Option<Instant>) -> Result<()> {
    let st = rt.sched.lock();
    match rt.park(st, ThreadState::BlockedOnIo, Link::Io(fd, interest), deadline) {
        WakeReason::TimedOut => Err(ThreadError::TimedOut),
        WakeReason::Revoked => Err(ThreadError::Os(errno::EBADF)),
        WakeReason::Canceled => {
            rt.cancel_point();
            Ok(())
        }
        _ => Ok(()),
    }
}

fn blocking_io<R>(
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
    mut op: impl FnMut() -> std::result::Result<R, i32>,
) -> Result<R> {
    let rt = runtime()?;
    rt.cancel_point();
    let claim: FdClaim = fd::claim(rt, fd, interest, deadline)?;
    if claim.user_nonblocking {
        return op().map_err(ThreadError::Os);
    }
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if errno::is_would_block(e) => {
                wait_ready(rt, fd, interest, deadline)?;
                if !claim.is_current() {
                    return Err(ThreadError::Os(errno::EBADF));
                }
            }
            Err(e) => return Err(ThreadError::Os(e)),
        }
    }
}

fn read_op(fd: RawFd, buf: &mut [u8]) -> impl FnMut() -> std::result::Result<usize, i32> + '_ {
    move || {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        sys_result(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }
}

fn write_op(fd: RawFd, buf: &[u8]) -> impl FnMut() -> std::result::Result<usize, i32> + '_ {
    move || {
        // SAFETY: `buf` is valid for `buf.len()` readable bytes.
        sys_result(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    blocking_io(fd, Interest::Read, None, read_op(fd, buf))
}

/// `read` that gives up with [`ThreadError::TimedOut`] at `deadline`.
pub fn read_until(fd: RawFd, buf: &mut [u8], deadline: Instant) -> Result<usize> {
    blocking_io(fd, Interest::Read, Some(deadline), read_op(fd, buf))
}

pub fn read_timeout(fd: RawFd, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    blocking_io(fd, Interest::Read, Instant::now().checked_add(timeout), read_op(fd, buf))
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    blocking_io(fd, Interest::Write, None, write_op(fd, buf))
}

pub fn write_until(fd: RawFd, buf: &[u8], deadline: Instant) -> Result<usize> {
    blocking_io(fd, Interest::Write, Some(deadline), write_op(fd, buf))
}

pub fn write_timeout(fd: RawFd, buf: &[u8], timeout: Duration) -> Result<usize> {
    blocking_io(fd, Interest::Write, Instant::now().checked_add(timeout), write_op(fd, buf))
}

/// Write all of `buf`, one blocking write at a time.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = write(fd, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

pub fn accept(fd: RawFd) -> Result<(RawFd, SockAddr)> {
    let mut peer = SockAddr::empty();
    let user_nonblocking = runtime()?.fds.lock().user_nonblocking(fd)?;
    let conn = blocking_io(fd, Interest::Read, None, || {
        peer = SockAddr::empty();
        let (addr, len) = peer.as_mut_parts();
        // SAFETY: `addr`/`len` describe `peer`'s storage.
        let rc = unsafe { libc::accept(fd, addr, len) };
        if rc < 0 { Err(errno::last()) } else { Ok(rc) }
    })?;
    if !user_nonblocking {
        clear_inherited_nonblocking(conn);
    }
    Ok((conn, peer))
}

/// BSD-derived kernels copy the listener's (overridden) `O_NONBLOCK` onto
/// the accepted socket.
#[cfg(not(target_os = "linux"))]
fn clear_inherited_nonblocking(fd: RawFd) {
    // SAFETY: plain fcntl calls on a descriptor the caller now owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
    }
}

#[cfg(target_os = "linux")]
fn clear_inherited_nonblocking(_fd: RawFd) {}

/// Connect, waiting for completion if the kernel reports `EINPROGRESS`
/// because of the non-blocking override.
pub fn connect(fd: RawFd, addr: &SockAddr) -> Result<()> {
    let rt = runtime()?;
    rt.cancel_point();
    let claim = fd::claim(rt, fd, Interest::Write, None)?;
    // SAFETY: `addr` owns a valid socket address of `addr.len()` bytes.
    if unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) } == 0 {
        return Ok(());
    }
    let e = errno::last();
    if e != errno::EINPROGRESS || claim.user_nonblocking {
        return Err(ThreadError::Os(e));
    }
    wait_ready(rt, fd, Interest::Write, None)?;
    if !claim.is_current() {
        return Err(ThreadError::Os(errno::EBADF));
    }
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `err`/`len` are valid out-parameters for SO_ERROR.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    drop(claim);
    if rc < 0 {
        return Err(ThreadError::last_os_error());
    }
    if err != 0 {
        return Err(ThreadError::Os(err));
    }
    Ok(())
}

/// Close `fd`. Threads blocked on it wake with `EBADF` and never retry
/// against whatever later reuses the number.
pub fn close(fd: RawFd) -> Result<()> {
    let rt = runtime()?;
    let mut fds = rt.fds.lock();
    {
        let mut st = rt.sched.lock();
        fds.revoke(fd, &mut st);
    }
    // SAFETY: closing a caller-supplied descriptor; the kernel validates it.
    if unsafe { libc::close(fd) } < 0 {
        return Err(ThreadError::last_os_error());
    }
    Ok(())
}

/// Make `new` refer to `old`'s open file. The shadow state of both numbers
/// is held for the whole swap, so no wrapper can observe it half done.
/// Threads blocked on the old `new` wake with `EBADF`; threads blocked on
/// `old` keep waiting on the same open file, which the swap does not touch.
pub fn dup2(old: RawFd, new: RawFd) -> Result<RawFd> {
    let rt = runtime()?;
    let mut fds = rt.fds.lock();
    // SAFETY: F_GETFL takes no pointer argument.
    if unsafe { libc::fcntl(old, libc::F_GETFL) } < 0 {
        return Err(ThreadError::last_os_error());
    }
    if old == new {
        return Ok(new);
    }
    {
        let mut st = rt.sched.lock();
        fds.revoke(new, &mut st);
    }
    // SAFETY: both numbers are caller-supplied; the kernel validates them.
    let rc = unsafe { libc::dup2(old, new) };
    if rc < 0 {
        return Err(ThreadError::last_os_error());
    }
    fds.alias(old, new)?;
    Ok(rc)
}

pub fn pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(ThreadError::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Set the user-visible blocking mode of `fd`. In non-blocking mode the
/// wrappers make a single attempt and report `EAGAIN` as-is.
pub fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    runtime()?.fds.lock().set_user_nonblocking(fd, on)
}
