//! Per-thread reentrancy guard
//!
//! Stack capture, symbolization and the report itself allocate. When they run
//! underneath an intercepted call, those allocations come straight back into
//! the hooks. The guard marks the current thread as "inside heappulse" so the
//! hooks forward such calls to the real allocator without touching the
//! registry.
//!
//! Releases are suppressed too. A block that was tracked and is freed inside a
//! scope keeps its record and is reported as a leak, so code running under the
//! guard should only free memory it allocated under the guard.
//!
//! The flag is a `const`-initialized `Cell<bool>`: it needs no lazy
//! initialization and registers no TLS destructor, so reading it never
//! allocates and keeps working while a thread is being torn down.

use std::cell::Cell;

thread_local! {
    static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while the current thread is inside a suppression scope
///
/// A thread whose TLS is no longer accessible is treated as suppressed.
#[inline]
#[must_use]
pub fn is_suppressed() -> bool {
    SUPPRESSED.try_with(Cell::get).unwrap_or(true)
}

/// RAII scope that disables tracking on the current thread
///
/// Scopes nest: dropping an inner scope restores the state that was active
/// when it was entered.
#[derive(Debug)]
#[must_use = "tracking is re-enabled as soon as the scope is dropped"]
pub struct SuppressionScope {
    previous: bool,
}

impl SuppressionScope {
    #[inline]
    pub fn enter() -> Self {
        let previous = SUPPRESSED.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self { previous }
    }

    /// End the scope without re-enabling tracking
    ///
    /// Returns the state to hand to [`resume`] once tracking may continue. Used
    /// where a scope spans two callbacks, as with the fork handlers.
    pub(crate) fn detach(self) -> bool {
        let previous = self.previous;
        std::mem::forget(self);
        previous
    }
}

/// Restore the state returned by [`SuppressionScope::detach`]
pub(crate) fn resume(previous: bool) {
    let _ = SUPPRESSED.try_with(|flag| flag.set(previous));
}

impl Drop for SuppressionScope {
    #[inline]
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = SUPPRESSED.try_with(|flag| flag.set(previous));
    }
}

/// Run `f` with tracking disabled on the current thread
#[inline]
pub fn suppressed<R>(f: impl FnOnce() -> R) -> R {
    let _scope = SuppressionScope::enter();
    f()
}
