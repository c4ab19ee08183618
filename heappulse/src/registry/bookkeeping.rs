//! Allocators for the registry's own storage
//!
//! The registry's hash maps must never allocate through the intercepted entry
//! points, otherwise growing a map while a shard lock is held would call back
//! into the registry. Maps are therefore parameterised over an
//! [`allocator_api2`] allocator that talks to the real allocator directly.

#![allow(unsafe_code)] // Allocator impls are unsafe by definition

use allocator_api2::alloc::{AllocError, Allocator};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

/// Bookkeeping storage served by [`std::alloc::System`]
///
/// Correct whenever the intercepted entry point is the Rust global allocator:
/// `System` calls the platform allocator without going through
/// `#[global_allocator]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBookkeeping;

// SAFETY: blocks come from `System` with the requested layout and are returned
// to `System` with the same layout; zero-sized requests get a dangling,
// well-aligned pointer that is never passed to `System`.
unsafe impl Allocator for SystemBookkeeping {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(layout), 0));
        }
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { System.alloc(layout) };
        NonNull::new(ptr)
            .map(|ptr| NonNull::slice_from_raw_parts(ptr, layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: caller guarantees `ptr` came from `allocate` with `layout`.
            unsafe { System.dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Well-aligned non-null pointer for zero-sized blocks
pub(crate) fn dangling(layout: Layout) -> NonNull<u8> {
    // SAFETY: alignment is a non-zero power of two.
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}
