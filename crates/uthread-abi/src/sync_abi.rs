//! Mutex, condition variable and once-control exports.

use std::ffi::c_int;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use uthread_core::{Condvar, Mutex, MutexKind, Once, errno};

use crate::status;

#[repr(C)]
#[derive(Debug)]
#[allow(non_camel_case_types)]
pub struct uthread_mutex_t {
    handle: *mut Mutex,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(non_camel_case_types)]
pub struct uthread_mutexattr_t {
    /// 0 normal, 1 recursive, 2 error-checking.
    pub kind: c_int,
}

#[repr(C)]
#[derive(Debug)]
#[allow(non_camel_case_types)]
pub struct uthread_cond_t {
    handle: *mut Condvar,
}

#[repr(C)]
#[derive(Debug)]
#[allow(non_camel_case_types)]
pub struct uthread_once_t {
    inner: AtomicPtr<Once>,
}

pub const UTHREAD_MUTEX_NORMAL: c_int = 0;
pub const UTHREAD_MUTEX_RECURSIVE: c_int = 1;
pub const UTHREAD_MUTEX_ERRORCHECK: c_int = 2;

impl uthread_mutex_t {
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            handle: ptr::null_mut(),
        }
    }
}

impl uthread_cond_t {
    #[must_use]
    pub const fn uninit() -> Self {
        Self {
            handle: ptr::null_mut(),
        }
    }
}

impl uthread_once_t {
    /// The static initializer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The control's `Once`, allocated by whichever caller gets here first.
    fn get(&self) -> &Once {
        let mut cur = self.inner.load(Ordering::Acquire);
        if cur.is_null() {
            let fresh = Box::into_raw(Box::new(Once::new()));
            match self
                .inner
                .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => cur = fresh,
                Err(existing) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    cur = existing;
                }
            }
        }
        // SAFETY: once published the box is never freed.
        unsafe { &*cur }
    }
}

impl Default for uthread_once_t {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// `m` must be null or point to a caller-owned handle.
unsafe fn mutex_of<'a>(m: *mut uthread_mutex_t) -> Option<&'a Mutex> {
    // SAFETY: forwarded from the caller.
    let handle = unsafe { m.as_ref() }?.handle;
    // SAFETY: a non-null handle came from `Box::into_raw` in `uthread_mutex_init`.
    unsafe { handle.as_ref() }
}

/// # Safety
///
/// `cv` must be null or point to a caller-owned handle.
unsafe fn cond_of<'a>(cv: *mut uthread_cond_t) -> Option<&'a Condvar> {
    // SAFETY: forwarded from the caller.
    let handle = unsafe { cv.as_ref() }?.handle;
    // SAFETY: a non-null handle came from `Box::into_raw` in `uthread_cond_init`.
    unsafe { handle.as_ref() }
}

/// Convert a `CLOCK_REALTIME` absolute time into a monotonic deadline.
/// `Ok(None)` means the time lies past what the clocks can represent, so the
/// wait has no deadline; a malformed `tv_nsec` is `EINVAL`.
pub(crate) fn deadline_from(abstime: &libc::timespec) -> Result<Option<Instant>, c_int> {
    if !(0..1_000_000_000).contains(&abstime.tv_nsec) {
        return Err(errno::EINVAL);
    }
    let secs = u64::try_from(abstime.tv_sec).unwrap_or(0);
    let Some(target) = UNIX_EPOCH.checked_add(Duration::new(secs, abstime.tv_nsec as u32)) else {
        return Ok(None);
    };
    let remaining = target
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Ok(Instant::now().checked_add(remaining))
}

abi_fn! {
    fn uthread_mutex_init(m: *mut uthread_mutex_t, attr: *const uthread_mutexattr_t) -> c_int {
        // SAFETY: `m` is null or caller-owned.
        let Some(slot) = (unsafe { m.as_mut() }) else {
            return errno::EINVAL;
        };
        if !slot.handle.is_null() {
            return errno::EBUSY;
        }
        // SAFETY: `attr` is null or caller-owned.
        let raw = unsafe { attr.as_ref() }.map_or(UTHREAD_MUTEX_NORMAL, |a| a.kind);
        let Some(kind) = MutexKind::from_raw(raw) else {
            return errno::EINVAL;
        };
        slot.handle = Box::into_raw(Box::new(Mutex::new(kind)));
        0
    }
}

abi_fn! {
    fn uthread_mutex_lock(m: *mut uthread_mutex_t) -> c_int {
        match mutex_of(m) {
            Some(mutex) => status(mutex.lock()),
            None => errno::EINVAL,
        }
    }
}

abi_fn! {
    fn uthread_mutex_trylock(m: *mut uthread_mutex_t) -> c_int {
        match mutex_of(m) {
            Some(mutex) => status(mutex.try_lock()),
            None => errno::EINVAL,
        }
    }
}

abi_fn! {
    fn uthread_mutex_timedlock(m: *mut uthread_mutex_t, abstime: *const libc::timespec) -> c_int {
        let (Some(mutex), Some(abstime)) = (mutex_of(m), abstime.as_ref()) else {
            return errno::EINVAL;
        };
        match deadline_from(abstime) {
            Ok(Some(deadline)) => status(mutex.lock_until(deadline)),
            Ok(None) => status(mutex.lock()),
            Err(e) => e,
        }
    }
}

abi_fn! {
    fn uthread_mutex_unlock(m: *mut uthread_mutex_t) -> c_int {
        match mutex_of(m) {
            Some(mutex) => status(mutex.unlock()),
            None => errno::EINVAL,
        }
    }
}

abi_fn! {
    /// Destroy and free the mutex; the handle reads as uninitialized after.
    fn uthread_mutex_destroy(m: *mut uthread_mutex_t) -> c_int {
        let Some(mutex) = mutex_of(m) else {
            return errno::EINVAL;
        };
        if let Err(e) = mutex.destroy() {
            return e.errno();
        }
        // SAFETY: `mutex_of` succeeded, so `m` and its handle are valid.
        let slot = &mut *m;
        drop(Box::from_raw(slot.handle));
        slot.handle = ptr::null_mut();
        0
    }
}

abi_fn! {
    fn uthread_cond_init(cv: *mut uthread_cond_t) -> c_int {
        // SAFETY: `cv` is null or caller-owned.
        let Some(slot) = (unsafe { cv.as_mut() }) else {
            return errno::EINVAL;
        };
        if !slot.handle.is_null() {
            return errno::EBUSY;
        }
        slot.handle = Box::into_raw(Box::new(Condvar::new()));
        0
    }
}

abi_fn! {
    fn uthread_cond_wait(cv: *mut uthread_cond_t, m: *mut uthread_mutex_t) -> c_int {
        let (Some(cond), Some(mutex)) = (cond_of(cv), mutex_of(m)) else {
            return errno::EINVAL;
        };
        status(cond.wait(mutex))
    }
}

abi_fn! {
    /// Returns `ETIMEDOUT` once `abstime` passes; the mutex is held again
    /// either way.
    fn uthread_cond_timedwait(
        cv: *mut uthread_cond_t,
        m: *mut uthread_mutex_t,
        abstime: *const libc::timespec,
    ) -> c_int {
        let (Some(cond), Some(mutex), Some(abstime)) = (cond_of(cv), mutex_of(m), abstime.as_ref()) else {
            return errno::EINVAL;
        };
        let waited = match deadline_from(abstime) {
            Ok(Some(deadline)) => cond.wait_until(mutex, deadline),
            Ok(None) => cond.wait(mutex).map(|()| false),
            Err(e) => return e,
        };
        match waited {
            Ok(true) => errno::ETIMEDOUT,
            Ok(false) => 0,
            Err(e) => e.errno(),
        }
    }
}

abi_fn! {
    fn uthread_cond_signal(cv: *mut uthread_cond_t) -> c_int {
        match cond_of(cv) {
            Some(cond) => status(cond.signal()),
            None => errno::EINVAL,
        }
    }
}

abi_fn! {
    fn uthread_cond_broadcast(cv: *mut uthread_cond_t) -> c_int {
        match cond_of(cv) {
            Some(cond) => status(cond.broadcast()),
            None => errno::EINVAL,
        }
    }
}

abi_fn! {
    fn uthread_cond_destroy(cv: *mut uthread_cond_t) -> c_int {
        let Some(cond) = cond_of(cv) else {
            return errno::EINVAL;
        };
        if let Err(e) = cond.destroy() {
            return e.errno();
        }
        // SAFETY: `cond_of` succeeded, so `cv` and its handle are valid.
        let slot = &mut *cv;
        drop(Box::from_raw(slot.handle));
        slot.handle = ptr::null_mut();
        0
    }
}

abi_fn! {
    fn uthread_once(once: *mut uthread_once_t, init: Option<unsafe extern "C-unwind" fn()>) -> c_int {
        let (Some(control), Some(init)) = (once.as_ref(), init) else {
            return errno::EINVAL;
        };
        // SAFETY: the caller supplies a callable initializer.
        status(control.get().call_once(|| unsafe { init() }))
    }
}
