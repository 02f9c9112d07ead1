//! Drive the C exports end to end with Rust callbacks.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use uthread_abi::errno_abi::get_errno;
use uthread_abi::io_abi::*;
use uthread_abi::signal_abi::*;
use uthread_abi::specific_abi::*;
use uthread_abi::sync_abi::*;
use uthread_abi::thread_abi::*;

unsafe fn run_main(f: uthread_start_t, arg: *mut c_void) -> usize {
    let mut out: *mut c_void = ptr::null_mut();
    let rc = unsafe { uthread_run(Some(f), arg, &mut out) };
    assert_eq!(rc, 0);
    out as usize
}

unsafe extern "C-unwind" fn add_one(arg: *mut c_void) -> *mut c_void {
    (arg as usize + 1) as *mut c_void
}

unsafe extern "C-unwind" fn spawn_and_join(_: *mut c_void) -> *mut c_void {
    let mut t: uthread_t = 0;
    unsafe {
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(add_one), 41 as *mut c_void), 0);
        let mut value: *mut c_void = ptr::null_mut();
        assert_eq!(uthread_join(t, &mut value), 0);
        value
    }
}

#[test]
fn run_and_join_pass_values_through() {
    unsafe {
        assert_eq!(run_main(add_one, 1 as *mut c_void), 2);
        assert_eq!(run_main(spawn_and_join, ptr::null_mut()), 42);
    }
}

struct Shared {
    mutex: uthread_mutex_t,
    cond: uthread_cond_t,
    ready: bool,
}

unsafe extern "C-unwind" fn waiter(arg: *mut c_void) -> *mut c_void {
    let shared = arg.cast::<Shared>();
    unsafe {
        assert_eq!(uthread_mutex_lock(&mut (*shared).mutex), 0);
        while !(*shared).ready {
            assert_eq!(uthread_cond_wait(&mut (*shared).cond, &mut (*shared).mutex), 0);
        }
        assert_eq!(uthread_mutex_unlock(&mut (*shared).mutex), 0);
    }
    7 as *mut c_void
}

unsafe extern "C-unwind" fn cond_round_trip(_: *mut c_void) -> *mut c_void {
    let mut shared = Shared {
        mutex: uthread_mutex_t::uninit(),
        cond: uthread_cond_t::uninit(),
        ready: false,
    };
    unsafe {
        assert_eq!(uthread_mutex_init(&mut shared.mutex, ptr::null()), 0);
        assert_eq!(uthread_mutex_init(&mut shared.mutex, ptr::null()), libc::EBUSY);
        assert_eq!(uthread_cond_init(&mut shared.cond), 0);

        let mut t: uthread_t = 0;
        let arg = (&mut shared as *mut Shared).cast::<c_void>();
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(waiter), arg), 0);
        uthread_yield();

        assert_eq!(uthread_mutex_lock(&mut shared.mutex), 0);
        shared.ready = true;
        assert_eq!(uthread_cond_signal(&mut shared.cond), 0);
        assert_eq!(uthread_mutex_unlock(&mut shared.mutex), 0);

        let mut value: *mut c_void = ptr::null_mut();
        assert_eq!(uthread_join(t, &mut value), 0);
        assert_eq!(value as usize, 7);

        assert_eq!(uthread_cond_destroy(&mut shared.cond), 0);
        assert_eq!(uthread_mutex_destroy(&mut shared.mutex), 0);
        assert_eq!(uthread_mutex_lock(&mut shared.mutex), libc::EINVAL);
    }
    ptr::null_mut()
}

#[test]
fn mutex_and_condvar_through_handles() {
    unsafe { run_main(cond_round_trip, ptr::null_mut()) };
}

unsafe extern "C-unwind" fn errorcheck_and_timeout(_: *mut c_void) -> *mut c_void {
    let mut m = uthread_mutex_t::uninit();
    let mut cv = uthread_cond_t::uninit();
    let attr = uthread_mutexattr_t {
        kind: UTHREAD_MUTEX_ERRORCHECK,
    };
    unsafe {
        assert_eq!(uthread_mutex_init(&mut m, &attr), 0);
        assert_eq!(uthread_cond_init(&mut cv), 0);
        assert_eq!(uthread_mutex_unlock(&mut m), libc::EPERM);
        assert_eq!(uthread_mutex_lock(&mut m), 0);
        assert_eq!(uthread_mutex_lock(&mut m), libc::EDEADLK);
        assert_eq!(uthread_mutex_trylock(&mut m), libc::EBUSY);

        let past = libc::timespec {
            tv_sec: 1,
            tv_nsec: 0,
        };
        assert_eq!(uthread_cond_timedwait(&mut cv, &mut m, &past), libc::ETIMEDOUT);
        // Still held after the timeout.
        assert_eq!(uthread_mutex_unlock(&mut m), 0);
        assert_eq!(uthread_mutex_destroy(&mut m), 0);
        assert_eq!(uthread_cond_destroy(&mut cv), 0);
    }
    ptr::null_mut()
}

#[test]
fn errorcheck_mutex_reports_errno_values() {
    unsafe { run_main(errorcheck_and_timeout, ptr::null_mut()) };
}

static ONCE_RUNS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C-unwind" fn once_init() {
    ONCE_RUNS.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C-unwind" fn once_racer(arg: *mut c_void) -> *mut c_void {
    unsafe {
        uthread_yield();
        assert_eq!(uthread_once(arg.cast(), Some(once_init)), 0);
    }
    ptr::null_mut()
}

unsafe extern "C-unwind" fn once_main(_: *mut c_void) -> *mut c_void {
    let mut control = uthread_once_t::new();
    let arg = (&mut control as *mut uthread_once_t).cast::<c_void>();
    let mut ids = [0 as uthread_t; 4];
    unsafe {
        for id in &mut ids {
            assert_eq!(uthread_create(id, ptr::null(), Some(once_racer), arg), 0);
        }
        for id in ids {
            assert_eq!(uthread_join(id, ptr::null_mut()), 0);
        }
    }
    ptr::null_mut()
}

#[test]
fn once_runs_initializer_once() {
    unsafe { run_main(once_main, ptr::null_mut()) };
    assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);
}

static FREED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C-unwind" fn free_value(p: *mut c_void) {
    FREED.fetch_add(p as usize, Ordering::SeqCst);
}

unsafe extern "C-unwind" fn keyed_worker(arg: *mut c_void) -> *mut c_void {
    let key = arg as uthread_key_t;
    unsafe {
        assert!(uthread_getspecific(key).is_null());
        assert_eq!(uthread_setspecific(key, 5 as *const c_void), 0);
        // Overwriting does not run the destructor on the old value.
        assert_eq!(uthread_setspecific(key, 10 as *const c_void), 0);
        assert_eq!(uthread_getspecific(key) as usize, 10);
    }
    ptr::null_mut()
}

unsafe extern "C-unwind" fn keys_main(_: *mut c_void) -> *mut c_void {
    let mut key: uthread_key_t = 0;
    unsafe {
        assert_eq!(uthread_key_create(&mut key, Some(free_value)), 0);
        let mut t: uthread_t = 0;
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(keyed_worker), key as *mut c_void), 0);
        assert_eq!(uthread_join(t, ptr::null_mut()), 0);
        assert_eq!(uthread_key_delete(key), 0);
    }
    ptr::null_mut()
}

#[test]
fn key_destructors_run_at_thread_exit() {
    unsafe { run_main(keys_main, ptr::null_mut()) };
    assert_eq!(FREED.load(Ordering::SeqCst), 10);
}

unsafe extern "C-unwind" fn pipe_reader(arg: *mut c_void) -> *mut c_void {
    let fd = arg as usize as c_int;
    let mut buf = [0u8; 8];
    let n = unsafe { uthread_read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(&buf[..n as usize], b"ping");
    n as usize as *mut c_void
}

unsafe extern "C-unwind" fn pipe_main(_: *mut c_void) -> *mut c_void {
    let mut fds = [0 as c_int; 2];
    unsafe {
        assert_eq!(uthread_pipe(fds.as_mut_ptr()), 0);
        let mut t: uthread_t = 0;
        let arg = fds[0] as usize as *mut c_void;
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(pipe_reader), arg), 0);
        uthread_yield();
        assert_eq!(uthread_write(fds[1], b"ping".as_ptr().cast(), 4), 4);
        let mut value: *mut c_void = ptr::null_mut();
        assert_eq!(uthread_join(t, &mut value), 0);
        assert_eq!(value as usize, 4);

        assert_eq!(uthread_close(fds[0]), 0);
        assert_eq!(uthread_close(fds[1]), 0);
        assert_eq!(uthread_close(fds[1]), -1);
        assert_eq!(get_errno(), libc::EBADF);
    }
    ptr::null_mut()
}

#[test]
fn pipe_io_reports_errno_on_failure() {
    unsafe { run_main(pipe_main, ptr::null_mut()) };
}

unsafe extern "C-unwind" fn stack_probe(_: *mut c_void) -> *mut c_void {
    let local = 0u8;
    let mut base: *mut c_void = ptr::null_mut();
    let mut size = 0usize;
    unsafe {
        assert_eq!(uthread_stackseg(uthread_self(), &mut base, &mut size), 0);
        let addr = &local as *const u8 as usize;
        assert!(addr >= base as usize && addr < base as usize + size);

        let mut old: libc::stack_t = std::mem::zeroed();
        assert_eq!(uthread_sigaltstack(ptr::null(), &mut old), 0);
        assert_eq!(old.ss_sp, base);
        assert_eq!(uthread_sigaltstack(&old, ptr::null_mut()), -1);
        assert_eq!(get_errno(), libc::ENOTSUP);
    }
    ptr::null_mut()
}

unsafe extern "C-unwind" fn mask_main(_: *mut c_void) -> *mut c_void {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        assert_eq!(uthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()), 0);
        let mut now: libc::sigset_t = std::mem::zeroed();
        assert_eq!(uthread_sigmask(0, ptr::null(), &mut now), 0);
        assert_eq!(libc::sigismember(&now, libc::SIGUSR1), 1);
        assert_eq!(uthread_sigmask(12345, &set, ptr::null_mut()), libc::EINVAL);

        let mut t: uthread_t = 0;
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(stack_probe), ptr::null_mut()), 0);
        assert_eq!(uthread_join(t, ptr::null_mut()), 0);
    }
    ptr::null_mut()
}

#[test]
fn signal_and_stack_exports() {
    unsafe { run_main(mask_main, ptr::null_mut()) };
}

unsafe extern "C-unwind" fn sleeper(_: *mut c_void) -> *mut c_void {
    loop {
        unsafe { uthread_testcancel() };
        unsafe { uthread_yield() };
    }
}

unsafe extern "C-unwind" fn cancel_main(_: *mut c_void) -> *mut c_void {
    let mut t: uthread_t = 0;
    unsafe {
        assert_eq!(uthread_create(&mut t, ptr::null(), Some(sleeper), ptr::null_mut()), 0);
        uthread_yield();
        assert_eq!(uthread_cancel(t), 0);
        let mut value: *mut c_void = ptr::null_mut();
        assert_eq!(uthread_join(t, &mut value), 0);
        assert_eq!(value, UTHREAD_CANCELED);
        assert_eq!(uthread_join(t, ptr::null_mut()), libc::ESRCH);
    }
    ptr::null_mut()
}

#[test]
fn canceled_join_yields_sentinel() {
    unsafe { run_main(cancel_main, ptr::null_mut()) };
}

#[test]
fn null_handles_are_rejected() {
    unsafe {
        assert_eq!(uthread_mutex_lock(ptr::null_mut()), libc::EINVAL);
        let mut m = uthread_mutex_t::uninit();
        assert_eq!(uthread_mutex_unlock(&mut m), libc::EINVAL);
        assert_eq!(uthread_run(None, ptr::null_mut(), ptr::null_mut()), libc::EINVAL);
        assert_eq!(uthread_self(), 0);
    }
}
