//! The process-wide writer lock.
//!
//! A plain mutex can deadlock during process teardown when the host's
//! globals are already gone, so the writer is guarded by a simple CAS
//! spinlock with exponential backoff and a 1 µs sleep once contention
//! persists. Held sections are short: one logical record each.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_utils::Backoff;

/// Spinlock-protected cell.
pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire unconditionally.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock_while(|| true)
            .expect("unconditional lock cannot be abandoned")
    }

    /// Acquire, re-checking `keep_waiting` between spins. Returns `None`
    /// once the predicate turns false; the timer thread uses this to bail
    /// out during shutdown instead of spinning on a lock that will never
    /// be released to it.
    pub fn lock_while(&self, keep_waiting: impl Fn() -> bool) -> Option<SpinlockGuard<'_, T>> {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            if !keep_waiting() {
                return None;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(1));
            } else {
                backoff.snooze();
            }
        }
        Some(SpinlockGuard { lock: self })
    }

    /// Overwrite the contents without locking or dropping the old value.
    ///
    /// # Safety
    ///
    /// Only sound when no other thread can touch the lock, i.e. in the
    /// child right after `fork()` where this process has exactly one
    /// thread. The old value is leaked on purpose: it may reference state
    /// shared with the parent.
    pub unsafe fn force_replace_and_leak(&self, value: T) {
        let old = std::mem::replace(unsafe { &mut *self.data.get() }, value);
        std::mem::forget(old);
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard; releases on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> std::ops::Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
