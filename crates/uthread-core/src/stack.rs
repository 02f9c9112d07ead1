//! Thread stacks: `mmap`ed regions with a `PROT_NONE` guard at the low end.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, ThreadError};
use crate::errno;

/// Usable bounds of a stack. Stacks grow down from `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

impl StackBounds {
    #[must_use]
    pub const fn size(&self) -> usize {
        self.high - self.low
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// An owned stack mapping, unmapped on drop.
#[derive(Debug)]
pub struct StackRegion {
    base: usize,
    total: usize,
    guard: usize,
}

impl StackRegion {
    /// Map `size` usable bytes (rounded up to whole pages) plus a `guard`
    /// region below them.
    pub fn allocate(size: usize, guard: usize) -> Result<Self> {
        if size == 0 {
            return Err(ThreadError::InvalidArgument("zero-sized stack"));
        }
        let usable = round_to_page(size);
        let guard = round_to_page(guard);
        let total = usable
            .checked_add(guard)
            .ok_or(ThreadError::ResourceExhausted(errno::ENOMEM))?;

        // SAFETY: anonymous private mapping, no fd.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ThreadError::from_alloc(errno::last()));
        }

        if guard > 0 {
            // SAFETY: `base` is the page-aligned start of the mapping just created.
            let rc = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
            if rc != 0 {
                let e = errno::last();
                // SAFETY: unmapping exactly what we mapped.
                unsafe { libc::munmap(base, total) };
                return Err(ThreadError::from_alloc(e));
            }
        }

        Ok(Self {
            base: base as usize,
            total,
            guard,
        })
    }

    #[must_use]
    pub fn bounds(&self) -> StackBounds {
        StackBounds {
            low: self.base + self.guard,
            high: self.base + self.total,
        }
    }

    #[must_use]
    pub fn guard_size(&self) -> usize {
        self.guard
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        // SAFETY: base/total describe the mapping created in `allocate`.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
    }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 { raw as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[must_use]
pub fn round_to_page(bytes: usize) -> usize {
    let page = page_size();
    bytes.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_page_rounded_and_writable() {
        let region = StackRegion::allocate(10_000, 4096).unwrap();
        let b = region.bounds();
        assert_eq!(b.size() % page_size(), 0);
        assert!(b.size() >= 10_000);
        assert_eq!(b.low % page_size(), 0);
        // Touch both ends of the usable range.
        // SAFETY: inside the RW part of the mapping.
        unsafe {
            *(b.low as *mut u8) = 1;
            *((b.high - 1) as *mut u8) = 2;
        }
        assert!(b.contains(b.low));
        assert!(!b.contains(b.high));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            StackRegion::allocate(0, 4096),
            Err(ThreadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn guard_can_be_disabled() {
        let region = StackRegion::allocate(page_size(), 0).unwrap();
        assert_eq!(region.guard_size(), 0);
        assert_eq!(region.bounds().size(), page_size());
    }
}
