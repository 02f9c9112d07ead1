//! Per-thread signal masks, alternate signal stacks and stack queries.

use std::fmt;
use std::mem::MaybeUninit;

use crate::error::{Result, ThreadError};
use crate::sched::{ThreadId, runtime};

/// Highest signal number probed when comparing sets.
#[cfg(target_os = "linux")]
const MAX_SIGNAL: libc::c_int = 64;
#[cfg(not(target_os = "linux"))]
const MAX_SIGNAL: libc::c_int = 31;

#[derive(Clone, Copy)]
pub struct SigSet(libc::sigset_t);

impl SigSet {
    #[must_use]
    pub fn empty() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset initializes the whole set.
        unsafe {
            libc::sigemptyset(set.as_mut_ptr());
            Self(set.assume_init())
        }
    }

    #[must_use]
    pub fn full() -> Self {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigfillset initializes the whole set.
        unsafe {
            libc::sigfillset(set.as_mut_ptr());
            Self(set.assume_init())
        }
    }

    /// The calling kernel thread's current mask.
    pub fn current() -> Result<Self> {
        let mut old = Self::empty();
        // SAFETY: a null new-set only queries.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut old.0) };
        if rc != 0 {
            return Err(ThreadError::Os(rc));
        }
        Ok(old)
    }

    pub fn add(&mut self, sig: libc::c_int) -> Result<()> {
        // SAFETY: `self.0` is an initialized set.
        if unsafe { libc::sigaddset(&mut self.0, sig) } < 0 {
            return Err(ThreadError::InvalidArgument("signal number out of range"));
        }
        Ok(())
    }

    pub fn remove(&mut self, sig: libc::c_int) -> Result<()> {
        // SAFETY: `self.0` is an initialized set.
        if unsafe { libc::sigdelset(&mut self.0, sig) } < 0 {
            return Err(ThreadError::InvalidArgument("signal number out of range"));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, sig: libc::c_int) -> bool {
        // SAFETY: `self.0` is an initialized set.
        unsafe { libc::sigismember(&self.0, sig) == 1 }
    }

    fn members(&self) -> impl Iterator<Item = libc::c_int> + '_ {
        (1..=MAX_SIGNAL).filter(|&s| self.contains(s))
    }

    #[must_use]
    pub fn as_raw(&self) -> &libc::sigset_t {
        &self.0
    }

    #[must_use]
    pub fn from_raw(raw: libc::sigset_t) -> Self {
        Self(raw)
    }

    fn apply(&self, how: SigmaskHow, other: &Self) -> Self {
        match how {
            SigmaskHow::SetMask => *other,
            SigmaskHow::Block => {
                let mut out = *self;
                for s in other.members() {
                    let _ = out.add(s);
                }
                out
            }
            SigmaskHow::Unblock => {
                let mut out = *self;
                for s in other.members() {
                    let _ = out.remove(s);
                }
                out
            }
        }
    }
}

impl PartialEq for SigSet {
    fn eq(&self, other: &Self) -> bool {
        (1..=MAX_SIGNAL).all(|s| self.contains(s) == other.contains(s))
    }
}

impl Eq for SigSet {}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaskHow {
    Block,
    Unblock,
    SetMask,
}

impl SigmaskHow {
    #[must_use]
    pub fn from_raw(how: libc::c_int) -> Option<Self> {
        match how {
            libc::SIG_BLOCK => Some(Self::Block),
            libc::SIG_UNBLOCK => Some(Self::Unblock),
            libc::SIG_SETMASK => Some(Self::SetMask),
            _ => None,
        }
    }
}

/// Load `set` into the kernel for the running green thread.
pub(crate) fn install(set: &SigSet) {
    // SAFETY: `set` is initialized; the old mask is not wanted.
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &set.0, std::ptr::null_mut()) };
}

/// Examine and change the calling thread's signal mask. Each green thread
/// keeps its own mask; the kernel mask is swapped on context switch. Returns
/// the previous mask. Outside a runtime this is plain `pthread_sigmask`.
pub fn sigmask(how: SigmaskHow, set: Option<&SigSet>) -> Result<SigSet> {
    let Ok(rt) = runtime() else {
        let old = SigSet::current()?;
        if let Some(set) = set {
            install(&old.apply(how, set));
        }
        return Ok(old);
    };
    let mut st = rt.sched.lock();
    let tcb = st.current_tcb();
    let old = tcb.sigmask;
    if let Some(set) = set {
        let new = old.apply(how, set);
        tcb.sigmask = new;
        install(&new);
        st.note_installed_mask(new);
    }
    Ok(old)
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltStack {
    pub base: usize,
    pub size: usize,
    pub flags: libc::c_int,
}

impl AltStack {
    fn from_raw(ss: &libc::stack_t) -> Self {
        Self {
            base: ss.ss_sp as usize,
            size: ss.ss_size,
            flags: ss.ss_flags,
        }
    }

    fn to_raw(self) -> libc::stack_t {
        libc::stack_t {
            ss_sp: self.base as *mut libc::c_void,
            ss_flags: self.flags,
            ss_size: self.size,
        }
    }
}

/// Alternate signal stack. The initial thread talks to the kernel. Any other
/// thread reports its own stack when queried and cannot install a new one,
/// since the kernel keeps a single alternate stack per kernel thread.
pub fn sigaltstack(new: Option<&AltStack>) -> Result<AltStack> {
    let owned = match runtime() {
        Ok(rt) => {
            let st = rt.sched.lock();
            if st.current == st.initial {
                None
            } else {
                st.tcb(st.current)
                    .and_then(|t| t.stack.as_ref())
                    .map(|s| s.bounds())
            }
        }
        Err(_) => None,
    };
    if let Some(bounds) = owned {
        if new.is_some() {
            return Err(ThreadError::NotSupported);
        }
        return Ok(AltStack {
            base: bounds.low,
            size: bounds.size(),
            flags: 0,
        });
    }

    let raw_new = new.map(|s| s.to_raw());
    let mut old = MaybeUninit::<libc::stack_t>::zeroed();
    let new_ptr = raw_new.as_ref().map_or(std::ptr::null(), |s| s as *const libc::stack_t);
    // SAFETY: both pointers are valid or null.
    if unsafe { libc::sigaltstack(new_ptr, old.as_mut_ptr()) } < 0 {
        return Err(ThreadError::last_os_error());
    }
    // SAFETY: sigaltstack filled `old` (and it was zeroed before).
    Ok(AltStack::from_raw(unsafe { old.assume_init_ref() }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    pub base: usize,
    pub size: usize,
}

/// Usable stack of `id`, or the process stack for the initial thread.
pub fn stack_info(id: ThreadId) -> Result<StackInfo> {
    let rt = runtime()?;
    let st = rt.sched.lock();
    let tcb = st.tcb(id).ok_or(ThreadError::NoSuchThread)?;
    match &tcb.stack {
        Some(region) => {
            let b = region.bounds();
            Ok(StackInfo {
                base: b.low,
                size: b.size(),
            })
        }
        None => {
            drop(st);
            process_stack()
        }
    }
}

/// Stack of the calling thread.
pub fn current_stack() -> Result<StackInfo> {
    match runtime() {
        Ok(rt) => stack_info(rt.current_id()),
        Err(_) => process_stack(),
    }
}

#[cfg(target_os = "linux")]
fn process_stack() -> Result<StackInfo> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: pthread_getattr_np initializes `attr` on success; it is
    // destroyed before returning.
    unsafe {
        let rc = libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr());
        if rc != 0 {
            return Err(ThreadError::Os(rc));
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        if rc != 0 {
            return Err(ThreadError::Os(rc));
        }
        Ok(StackInfo {
            base: addr as usize,
            size,
        })
    }
}

#[cfg(target_os = "macos")]
fn process_stack() -> Result<StackInfo> {
    // SAFETY: queries on the calling thread's own handle.
    unsafe {
        let this = libc::pthread_self();
        let top = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        Ok(StackInfo {
            base: top - size,
            size,
        })
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn process_stack() -> Result<StackInfo> {
    Err(ThreadError::NotSupported)
}
