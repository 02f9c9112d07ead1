//! Errno constants used by the runtime and its ABI layer.
//!
//! Values come from the host libc so they match what the kernel reports.

pub const EPERM: i32 = libc::EPERM;
pub const ESRCH: i32 = libc::ESRCH;
pub const EINTR: i32 = libc::EINTR;
pub const EBADF: i32 = libc::EBADF;
pub const EAGAIN: i32 = libc::EAGAIN;
pub const EWOULDBLOCK: i32 = libc::EWOULDBLOCK;
pub const ENOMEM: i32 = libc::ENOMEM;
pub const EBUSY: i32 = libc::EBUSY;
pub const EINVAL: i32 = libc::EINVAL;
pub const EDEADLK: i32 = libc::EDEADLK;
pub const ENOTSUP: i32 = libc::ENOTSUP;
pub const ETIMEDOUT: i32 = libc::ETIMEDOUT;
pub const EINPROGRESS: i32 = libc::EINPROGRESS;
pub const ECANCELED: i32 = libc::ECANCELED;
pub const ENOSYS: i32 = libc::ENOSYS;

/// Errno left behind by the last failing libc call on this kernel thread.
#[must_use]
pub fn last() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(EINVAL)
}

/// True for the "would block" pair, which differ on some targets.
#[must_use]
pub const fn is_would_block(e: i32) -> bool {
    e == EAGAIN || e == EWOULDBLOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_covers_both_spellings() {
        assert!(is_would_block(EAGAIN));
        assert!(is_would_block(EWOULDBLOCK));
        assert!(!is_would_block(EINTR));
    }
}
