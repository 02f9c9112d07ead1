//! Signal-mask, alternate-stack and stack-segment exports.

use std::ffi::{c_int, c_void};

use uthread_core::signal::{self, AltStack, SigSet, SigmaskHow};
use uthread_core::{ThreadId, errno};

use crate::errno_abi::fail;
use crate::thread_abi::uthread_t;

abi_fn! {
    /// Same contract as `pthread_sigmask`: returns an errno value and leaves
    /// `errno` alone.
    fn uthread_sigmask(how: c_int, set: *const libc::sigset_t, old: *mut libc::sigset_t) -> c_int {
        // SAFETY: `set` is null or caller-owned.
        let set = set.as_ref().map(|raw| SigSet::from_raw(*raw));
        let how = match (SigmaskHow::from_raw(how), set.is_some()) {
            (Some(h), _) => h,
            // `how` is ignored when only querying.
            (None, false) => SigmaskHow::Block,
            (None, true) => return errno::EINVAL,
        };
        match signal::sigmask(how, set.as_ref()) {
            Ok(prev) => {
                // SAFETY: `old` is null or caller-owned.
                if let Some(out) = old.as_mut() {
                    *out = *prev.as_raw();
                }
                0
            }
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    fn uthread_sigaltstack(ss: *const libc::stack_t, old: *mut libc::stack_t) -> c_int {
        // SAFETY: `ss` is null or caller-owned.
        let new = ss.as_ref().map(|raw| AltStack {
            base: raw.ss_sp as usize,
            size: raw.ss_size,
            flags: raw.ss_flags,
        });
        match signal::sigaltstack(new.as_ref()) {
            Ok(prev) => {
                // SAFETY: `old` is null or caller-owned.
                if let Some(out) = old.as_mut() {
                    out.ss_sp = prev.base as *mut c_void;
                    out.ss_size = prev.size;
                    out.ss_flags = prev.flags;
                }
                0
            }
            Err(e) => fail(&e),
        }
    }
}

abi_fn! {
    /// Lowest address and size of `thread`'s stack. Returns an errno value.
    fn uthread_stackseg(thread: uthread_t, base: *mut *mut c_void, size: *mut usize) -> c_int {
        if base.is_null() || size.is_null() {
            return errno::EINVAL;
        }
        match signal::stack_info(ThreadId::from_u64(thread)) {
            Ok(info) => {
                // SAFETY: both out-pointers checked above.
                *base = info.base as *mut c_void;
                *size = info.size;
                0
            }
            Err(e) => e.errno(),
        }
    }
}
