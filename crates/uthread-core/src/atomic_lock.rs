//! Single-word lock built on compare-and-swap.
//!
//! [`AtomicLock`] is the substrate every higher-level exclusion primitive is
//! built from. It never allocates or blocks, so it stays usable from a signal
//! handler, but it queues nobody and promises no fairness.
//!
//! [`SpinLock`] pairs an `AtomicLock` with the data it guards. The runtime
//! only runs one green thread at a time per kernel thread, so contention on a
//! `SpinLock` means the holder was interrupted mid-section (a signal handler
//! reentering the runtime) and can never release it. After a bounded spin
//! that is treated as a fatal error instead of a silent hang.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::fatal;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spin bound before a held `SpinLock` is declared wedged.
const WEDGE_SPINS: u32 = 1 << 20;

#[derive(Debug, Default)]
pub struct AtomicLock {
    word: AtomicU32,
}

impl AtomicLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Atomically test-and-set. Returns whether this call took the lock.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Clear the word. Only the holder may call this.
    #[inline]
    pub fn release(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }

    /// Advisory only: the answer may be stale by the time it is read.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) == LOCKED
    }
}

pub struct SpinLock<T> {
    lock: AtomicLock,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `lock`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: AtomicLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins = 0u32;
        while !self.lock.try_acquire() {
            spins += 1;
            if spins >= WEDGE_SPINS {
                fatal("spin lock wedged: runtime reentered while a section was held");
            }
            std::hint::spin_loop();
        }
        SpinGuard { owner: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.lock.try_acquire().then_some(SpinGuard { owner: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub struct SpinGuard<'a, T> {
    owner: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_acquirer_wins() {
        let lock = AtomicLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        assert!(lock.is_locked());
        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_acquire());
    }

    #[test]
    fn contended_cas_admits_exactly_one_holder_at_a_time() {
        let lock = Arc::new(AtomicLock::new());
        let inside = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        while !lock.try_acquire() {
                            std::hint::spin_loop();
                        }
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn spin_lock_guards_value() {
        let lock = SpinLock::new(vec![1, 2]);
        lock.lock().push(3);
        assert!(lock.try_lock().is_some());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        assert_eq!(*held, vec![1, 2, 3]);
    }
}
