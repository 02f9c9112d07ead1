//! Thread-specific data exports.
//!
//! Keys belong to the runtime of the calling kernel thread, so the table of
//! C destructors is kept per kernel thread as well.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::ptr;

use uthread_core::{Key, errno};

use crate::status;

#[allow(non_camel_case_types)]
pub type uthread_key_t = u64;
#[allow(non_camel_case_types)]
pub type uthread_destructor_t = unsafe extern "C-unwind" fn(*mut c_void);

thread_local! {
    static DESTRUCTORS: RefCell<HashMap<u64, Option<uthread_destructor_t>>> =
        RefCell::new(HashMap::new());
}

/// A C value stored under a key. Dropping it is how the runtime runs the
/// key's destructor at thread exit.
struct CValue {
    ptr: *mut c_void,
    dtor: Option<uthread_destructor_t>,
}

impl Drop for CValue {
    fn drop(&mut self) {
        if let (false, Some(dtor)) = (self.ptr.is_null(), self.dtor) {
            // SAFETY: the destructor was registered for this key's values.
            unsafe { dtor(self.ptr) };
        }
    }
}

fn destructor_for(key: u64) -> Option<uthread_destructor_t> {
    DESTRUCTORS.with(|d| d.borrow().get(&key).copied().flatten())
}

abi_fn! {
    fn uthread_key_create(out: *mut uthread_key_t, destructor: Option<uthread_destructor_t>) -> c_int {
        if out.is_null() {
            return errno::EINVAL;
        }
        match Key::create() {
            Ok(key) => {
                let raw = key.as_u64();
                DESTRUCTORS.with(|d| d.borrow_mut().insert(raw, destructor));
                // SAFETY: checked non-null above.
                *out = raw;
                0
            }
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    fn uthread_key_delete(key: uthread_key_t) -> c_int {
        let r = Key::from_u64(key).delete();
        if r.is_ok() {
            DESTRUCTORS.with(|d| d.borrow_mut().remove(&key));
        }
        status(r)
    }
}

abi_fn! {
    /// The calling thread's value for `key`, or null.
    fn uthread_getspecific(key: uthread_key_t) -> *mut c_void {
        Key::from_u64(key)
            .with(|v: Option<&CValue>| v.map_or(ptr::null_mut(), |c| c.ptr))
            .unwrap_or(ptr::null_mut())
    }
}

abi_fn! {
    /// Replacing a value does not run the destructor on the old one.
    fn uthread_setspecific(key: uthread_key_t, value: *const c_void) -> c_int {
        let stored = CValue {
            ptr: value.cast_mut(),
            dtor: destructor_for(key),
        };
        match Key::from_u64(key).replace(stored) {
            Ok(old) => {
                if let Some(old) = old {
                    std::mem::forget(old);
                }
                0
            }
            Err(e) => e.errno(),
        }
    }
}
