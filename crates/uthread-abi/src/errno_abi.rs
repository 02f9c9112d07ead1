//! Host `errno` access for the functions that report through it.

use std::ffi::c_int;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut c_int {
    // SAFETY: returns this kernel thread's errno slot.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut c_int {
    // SAFETY: returns this kernel thread's errno slot.
    unsafe { libc::__error() }
}

pub fn set_errno(value: c_int) {
    // SAFETY: the slot is valid for the lifetime of the kernel thread.
    unsafe { *errno_location() = value };
}

#[must_use]
pub fn get_errno() -> c_int {
    // SAFETY: as above.
    unsafe { *errno_location() }
}

/// Report `err` through `errno` and return `-1`.
pub(crate) fn fail<T: From<i8>>(err: &uthread_core::ThreadError) -> T {
    set_errno(err.errno());
    T::from(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips() {
        set_errno(libc::EBADF);
        assert_eq!(get_errno(), libc::EBADF);
        let r: isize = fail(&uthread_core::ThreadError::TimedOut);
        assert_eq!(r, -1);
        assert_eq!(get_errno(), libc::ETIMEDOUT);
    }
}
