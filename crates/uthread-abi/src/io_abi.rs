//! Blocking I/O exports. These follow the system-call convention: `-1` and
//! `errno` on failure.

use std::ffi::{c_int, c_void};

use uthread_core::io::{self, SockAddr};
use uthread_core::{ThreadError, errno};

use crate::errno_abi::fail;

abi_fn! {
    fn uthread_read(fd: c_int, buf: *mut c_void, len: usize) -> isize {
        if buf.is_null() && len != 0 {
            return fail(&ThreadError::Os(errno::EINVAL));
        }
        let slice: &mut [u8] = if len == 0 {
            &mut []
        } else {
            // SAFETY: the caller hands over `len` writable bytes.
            std::slice::from_raw_parts_mut(buf.cast::<u8>(), len)
        };
        match io::read(fd, slice) {
            Ok(n) => n as isize,
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    fn uthread_write(fd: c_int, buf: *const c_void, len: usize) -> isize {
        if buf.is_null() && len != 0 {
            return fail(&ThreadError::Os(errno::EINVAL));
        }
        let slice: &[u8] = if len == 0 {
            &[]
        } else {
            // SAFETY: the caller hands over `len` readable bytes.
            std::slice::from_raw_parts(buf.cast::<u8>(), len)
        };
        match io::write(fd, slice) {
            Ok(n) => n as isize,
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    /// Accept a connection. When `addr` is non-null the peer address is
    /// truncated to `*addrlen` bytes and `*addrlen` is set to its full size.
    fn uthread_accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> c_int {
        if !addr.is_null() && addrlen.is_null() {
            return fail(&ThreadError::Os(errno::EINVAL));
        }
        let (conn, peer) = match io::accept(fd) {
            Ok(v) => v,
            Err(e) => return fail(&e),
        };
        if !addr.is_null() {
            // SAFETY: checked non-null above; the caller owns both buffers.
            let room = *addrlen as usize;
            let n = room.min(peer.len() as usize);
            std::ptr::copy_nonoverlapping(peer.as_ptr().cast::<u8>(), addr.cast::<u8>(), n);
            *addrlen = peer.len();
        }
        conn
    }
}

abi_fn! {
    fn uthread_connect(fd: c_int, addr: *const libc::sockaddr, len: libc::socklen_t) -> c_int {
        // SAFETY: the caller hands over `len` readable bytes at `addr`.
        let Some(target) = SockAddr::from_raw(addr, len) else {
            return fail(&ThreadError::Os(errno::EINVAL));
        };
        match io::connect(fd, &target) {
            Ok(()) => 0,
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    fn uthread_close(fd: c_int) -> c_int {
        match io::close(fd) {
            Ok(()) => 0,
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    fn uthread_dup2(old: c_int, new: c_int) -> c_int {
        match io::dup2(old, new) {
            Ok(fd) => fd,
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    fn uthread_pipe(fds: *mut c_int) -> c_int {
        if fds.is_null() {
            return fail(&ThreadError::Os(errno::EINVAL));
        }
        match io::pipe() {
            Ok((r, w)) => {
                // SAFETY: the caller provides room for two descriptors.
                *fds = r;
                *fds.add(1) = w;
                0
            }
            Err(e) => fail(&e),
        }
    }
}
