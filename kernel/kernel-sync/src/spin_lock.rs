//! # Spin Lock
//!
//! Busy-waiting mutual exclusion for short, pointer-only critical sections.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin lock sized and aligned to one cache line.
///
/// Intended for critical sections that touch a handful of words (freelist
/// heads, counters). The `#[repr(align(64))]` keeps a statically allocated
/// lock from sharing its cache line with unrelated hot data.
///
/// # Guarantees
/// - Mutual exclusion for the protected value; acquire/release ordering on
///   the lock word makes writes inside the section visible to the next
///   holder.
/// - `Sync` when `T: Send`, so a `static` lock can be shared across CPUs.
///
/// # Caveats
/// - Does **not** mask interrupts; the embedding kernel decides whether the
///   calling context may take an interrupt while spinning.
/// - Busy-waits with [`core::hint::spin_loop`]; keep sections short and never
///   call out (no allocation, no callbacks) while holding the lock.
#[repr(align(64))]
pub struct SpinLock<T> {
    /// Lock state (`false` = unlocked).
    locked: AtomicBool,
    /// The protected value.
    inner: UnsafeCell<T>,
}

// Safety: the lock enforces exclusive access, so sharing is sound whenever
// the protected value may be sent between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spin lock wrapping `inner`.
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Returns a guard that releases the lock on drop.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Read-only wait so contending CPUs do not ping-pong the line.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Execute `f` with exclusive access to the inner value.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Access the inner value through `&mut self` without locking.
    ///
    /// Exclusive borrow of the lock itself proves no other reference exists.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard created by [`SpinLock::lock`]; releases the lock when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
