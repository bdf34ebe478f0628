//! Thread-local recursion guard.
//!
//! Every hook allocates, formats, and walks its own stack; any of that can
//! call back into an intercepted function. The guard makes such nested
//! calls invisible: while a thread holds the guard, its hooks return
//! immediately.

use std::cell::Cell;

thread_local! {
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard; constructing it marks the thread as inside the tracker.
pub struct RecursionGuard {
    was_active: bool,
}

impl RecursionGuard {
    pub fn new() -> Self {
        let was_active = ACTIVE.with(|a| a.replace(true));
        Self { was_active }
    }

    /// Whether the current thread is already inside the tracker.
    pub fn is_active() -> bool {
        ACTIVE.with(Cell::get)
    }

    /// Force the guard on for this thread without an RAII scope.
    ///
    /// Used by the fork hooks: no tracking may happen between `fork()` in
    /// the parent and the child deciding its own fate.
    pub fn block() {
        ACTIVE.with(|a| a.set(true));
    }

    /// Undo [`RecursionGuard::block`].
    pub fn unblock() {
        ACTIVE.with(|a| a.set(false));
    }
}

impl Default for RecursionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(self.was_active));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nesting() {
        assert!(!RecursionGuard::is_active());
        {
            let _outer = RecursionGuard::new();
            assert!(RecursionGuard::is_active());
            {
                let _inner = RecursionGuard::new();
                assert!(RecursionGuard::is_active());
            }
            // dropping the inner guard must not clear the outer scope
            assert!(RecursionGuard::is_active());
        }
        assert!(!RecursionGuard::is_active());
    }

    #[test]
    fn test_block_unblock() {
        RecursionGuard::block();
        assert!(RecursionGuard::is_active());
        RecursionGuard::unblock();
        assert!(!RecursionGuard::is_active());
    }
}
