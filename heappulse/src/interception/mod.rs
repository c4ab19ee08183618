//! # Interception Layer
//!
//! Hook logic shared by both ways of installing heappulse:
//!
//! - [`global`]: [`LeakTracker`](global::LeakTracker), a wrapping
//!   `#[global_allocator]` for Rust programs
//! - `preload` (feature `preload`): exported `malloc`/`free`/`realloc` for
//!   injection into any dynamically linked process with `LD_PRELOAD`
//!
//! Each surface forwards to the real allocator and calls into this module
//! around the real call:
//!
//! ```text
//! request(size)  ──► real alloc ──► record_request ──► capture ──► registry.insert
//! release(ptr)   ──► record_release ──► registry.remove ──► real free
//! resize(ptr, n) ──► registry.take ──► real realloc ──► record_request (or put back)
//! ```
//!
//! Release removes the record *before* the real free: once the block is back
//! in the allocator another thread may receive the same address, and its fresh
//! record must not be the one we delete.
//!
//! While the current thread is inside a suppression scope every hook here is a
//! no-op, which is what keeps the unwinder's and the report's own allocations
//! out of the registry.

pub mod global;
#[cfg(feature = "preload")]
pub mod preload;

use allocator_api2::alloc::Allocator;
use heappulse_common::{AllocationRecord, MAX_TRACE_DEPTH};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::capture;
use crate::guard::{self, SuppressionScope};
use crate::registry::AllocationRegistry;

/// Frames captured per allocation (set from configuration at install time)
static CAPTURE_DEPTH: AtomicUsize = AtomicUsize::new(MAX_TRACE_DEPTH);

pub(crate) fn set_capture_depth(depth: usize) {
    CAPTURE_DEPTH.store(depth.min(MAX_TRACE_DEPTH), Ordering::Relaxed);
}

#[must_use]
pub fn capture_depth() -> usize {
    CAPTURE_DEPTH.load(Ordering::Relaxed)
}

/// Track a block the real allocator just returned
///
/// Null results and calls made inside a suppression scope are ignored. Always
/// inlined into the hook, so the captured trace starts at the hook's frame.
#[inline(always)]
pub(crate) fn record_request<B: Allocator + Clone>(
    registry: &AllocationRegistry<B>,
    ptr: *mut u8,
    size: usize,
) {
    if ptr.is_null() || guard::is_suppressed() {
        return;
    }

    // The unwinder may allocate through the intercepted path.
    let _scope = SuppressionScope::enter();
    let floor = 0_u8;
    let floor = std::ptr::from_ref(std::hint::black_box(&floor)) as usize;
    let stack = capture::capture_above(capture_depth(), floor);
    registry.insert(AllocationRecord::new(ptr as usize, size, stack));
}

/// Forget a block that is about to go back to the real allocator
///
/// Unknown addresses are not an error: the block may predate installation or
/// come from an entry point that is not intercepted. Inside a suppression
/// scope the record is left alone (see [`guard`]).
#[inline]
pub(crate) fn record_release<B: Allocator + Clone>(registry: &AllocationRegistry<B>, ptr: *mut u8) {
    if ptr.is_null() || guard::is_suppressed() {
        return;
    }
    registry.remove(ptr as usize);
}

/// Run a real `realloc` and move the record from the old to the new block
///
/// On failure the old block is still owned by the caller, so its record is put
/// back, unless `new_size` is zero, which C `realloc` treats as a release.
#[inline(always)]
pub(crate) fn record_resize<B: Allocator + Clone>(
    registry: &AllocationRegistry<B>,
    old: *mut u8,
    new_size: usize,
    real_realloc: impl FnOnce() -> *mut u8,
) -> *mut u8 {
    if guard::is_suppressed() {
        return real_realloc();
    }

    let previous = if old.is_null() { None } else { registry.take(old as usize) };
    let new = real_realloc();

    if new.is_null() {
        if new_size != 0 {
            if let Some(record) = previous {
                registry.restore(record);
            }
        }
    } else {
        record_request(registry, new, new_size);
    }
    new
}
