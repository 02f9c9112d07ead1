//! Runtime entry and thread lifecycle.

use std::ffi::{c_int, c_void};

use uthread_core::{Builder, ThreadError, ThreadId, errno};

use crate::status;

#[allow(non_camel_case_types)]
pub type uthread_t = u64;
#[allow(non_camel_case_types)]
pub type uthread_start_t = unsafe extern "C-unwind" fn(*mut c_void) -> *mut c_void;

/// Value stored by `uthread_join` for a canceled thread.
pub const UTHREAD_CANCELED: *mut c_void = usize::MAX as *mut c_void;

pub const UTHREAD_CREATE_JOINABLE: c_int = 0;
pub const UTHREAD_CREATE_DETACHED: c_int = 1;
pub const UTHREAD_CANCEL_ENABLE: c_int = 0;
pub const UTHREAD_CANCEL_DISABLE: c_int = 1;

/// Creation attributes. A zero `stack_size` means the runtime default.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct uthread_attr_t {
    pub stack_size: usize,
    pub detach_state: c_int,
}

fn id_of(t: uthread_t) -> ThreadId {
    ThreadId::from_u64(t)
}

abi_fn! {
    /// Run `start(arg)` as the initial thread of a fresh runtime on the
    /// calling kernel thread. Its return value is stored in `*result` when
    /// `result` is non-null.
    fn uthread_run(start: Option<uthread_start_t>, arg: *mut c_void, result: *mut *mut c_void) -> c_int {
        let Some(start) = start else {
            return errno::EINVAL;
        };
        let body = || {
            // SAFETY: the caller supplies a valid start routine for `arg`.
            let out = unsafe { start(arg) };
            out as usize
        };
        match uthread_core::run(body) {
            Ok(value) => {
                if !result.is_null() {
                    // SAFETY: non-null out-parameter supplied by the caller.
                    unsafe { *result = value as *mut c_void };
                }
                0
            }
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    fn uthread_create(
        thread: *mut uthread_t,
        attr: *const uthread_attr_t,
        start: Option<uthread_start_t>,
        arg: *mut c_void,
    ) -> c_int {
        let Some(start) = start else {
            return errno::EINVAL;
        };
        // SAFETY: `attr` is null or points to caller-owned attributes.
        let attr = unsafe { attr.as_ref() }.copied().unwrap_or_default();
        let mut builder = Builder::new().detached(attr.detach_state == UTHREAD_CREATE_DETACHED);
        if attr.stack_size != 0 {
            builder = builder.stack_size(attr.stack_size);
        }
        let arg = arg as usize;
        let body = move || {
            // SAFETY: the caller vouches that `start` accepts `arg`.
            let out = unsafe { start(arg as *mut c_void) };
            out as usize
        };
        match builder.spawn(body) {
            Ok(handle) => {
                let id = handle.into_id();
                if !thread.is_null() {
                    // SAFETY: non-null out-parameter supplied by the caller.
                    unsafe { *thread = id.as_u64() };
                }
                0
            }
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    /// Wait for `thread`. A canceled thread reports [`UTHREAD_CANCELED`].
    fn uthread_join(thread: uthread_t, value: *mut *mut c_void) -> c_int {
        let out = match uthread_core::join_id(id_of(thread)) {
            Ok(v) => match v.downcast::<usize>() {
                Ok(v) => *v as *mut c_void,
                Err(_) => std::ptr::null_mut(),
            },
            Err(ThreadError::Canceled) => UTHREAD_CANCELED,
            Err(e) => return e.errno(),
        };
        if !value.is_null() {
            // SAFETY: non-null out-parameter supplied by the caller.
            unsafe { *value = out };
        }
        0
    }
}

abi_fn! {
    fn uthread_detach(thread: uthread_t) -> c_int {
        status(uthread_core::detach(id_of(thread)))
    }
}

abi_fn! {
    /// End the calling thread with `value`.
    fn uthread_exit(value: *mut c_void) -> ! {
        uthread_core::exit(value as usize)
    }
}

abi_fn! {
    /// Id of the calling thread, or 0 outside a runtime.
    fn uthread_self() -> uthread_t {
        uthread_core::current().map_or(0, ThreadId::as_u64)
    }
}

abi_fn! {
    fn uthread_equal(a: uthread_t, b: uthread_t) -> c_int {
        c_int::from(a == b)
    }
}

abi_fn! {
    fn uthread_yield() -> c_int {
        status(uthread_core::yield_now())
    }
}

abi_fn! {
    fn uthread_cancel(thread: uthread_t) -> c_int {
        status(uthread_core::cancel(id_of(thread)))
    }
}

abi_fn! {
    fn uthread_testcancel() -> c_int {
        status(uthread_core::test_cancel())
    }
}

abi_fn! {
    fn uthread_setcancelstate(state: c_int, old: *mut c_int) -> c_int {
        let enable = match state {
            UTHREAD_CANCEL_ENABLE => true,
            UTHREAD_CANCEL_DISABLE => false,
            _ => return errno::EINVAL,
        };
        match uthread_core::set_cancel_enabled(enable) {
            Ok(was) => {
                if !old.is_null() {
                    let prev = if was { UTHREAD_CANCEL_ENABLE } else { UTHREAD_CANCEL_DISABLE };
                    // SAFETY: non-null out-parameter supplied by the caller.
                    unsafe { *old = prev };
                }
                0
            }
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    fn uthread_suspend(thread: uthread_t) -> c_int {
        status(uthread_core::suspend(id_of(thread)))
    }
}

abi_fn! {
    fn uthread_resume(thread: uthread_t) -> c_int {
        status(uthread_core::resume(id_of(thread)))
    }
}
