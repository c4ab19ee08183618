//! `#[global_allocator]` surface
//!
//! ```rust,ignore
//! use heappulse::LeakTracker;
//! use std::alloc::System;
//!
//! #[global_allocator]
//! static GLOBAL: LeakTracker<System> = LeakTracker::system();
//! ```
//!
//! Every allocation the program makes through the Rust global allocator is
//! tracked in [`registry::global`](crate::registry::global), and the leak
//! report is printed when the process exits. Settings come from the
//! `HEAPPULSE_*` environment variables (see [`config`](crate::config)), read on
//! the first tracked allocation.

#![allow(unsafe_code)] // GlobalAlloc is an unsafe trait

use std::alloc::{GlobalAlloc, Layout, System};

use super::{record_release, record_request, record_resize};
use crate::config::Config;
use crate::guard;
use crate::lifecycle;
use crate::registry;

/// Leak-tracking wrapper around another global allocator
///
/// All requests are forwarded to `A` unchanged; the wrapper only observes
/// them. The registry's own storage uses [`System`] directly, so wrapping
/// `System` (or any allocator that does not itself route back through the
/// Rust global allocator) is always safe.
#[derive(Debug)]
pub struct LeakTracker<A = System> {
    inner: A,
    exit_report: bool,
}

impl LeakTracker<System> {
    /// Track allocations served by [`System`]
    #[must_use]
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A> LeakTracker<A> {
    /// Track allocations served by `inner`
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner, exit_report: true }
    }

    /// Track allocations but never print the report at exit
    ///
    /// For programs that inspect the registry themselves, such as test
    /// harnesses, and call [`lifecycle::report_now`] when they want output.
    #[must_use]
    pub const fn without_exit_report(inner: A) -> Self {
        Self { inner, exit_report: false }
    }

    #[inline]
    fn ensure_installed(&self) {
        if lifecycle::is_installed() {
            return;
        }
        let exit_report = self.exit_report;
        lifecycle::install_with(registry::global(), move || {
            let mut config = Config::load();
            config.report_at_exit &= exit_report;
            config
        });
    }
}

// SAFETY: every method forwards to `inner` with the caller's arguments and
// returns its result unchanged. Tracking never touches the blocks themselves.
unsafe impl<A: GlobalAlloc> GlobalAlloc for LeakTracker<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded contract.
        let ptr = unsafe { self.inner.alloc(layout) };
        if !guard::is_suppressed() {
            self.ensure_installed();
            record_request(registry::global(), ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded contract.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !guard::is_suppressed() {
            self.ensure_installed();
            record_request(registry::global(), ptr, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        record_release(registry::global(), ptr);
        // SAFETY: forwarded contract.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !guard::is_suppressed() {
            self.ensure_installed();
        }
        // SAFETY: forwarded contract. `new_size` is never zero here, so a
        // null result always leaves the old block (and its record) valid.
        record_resize(registry::global(), ptr, new_size, || unsafe {
            self.inner.realloc(ptr, layout, new_size)
        })
    }
}
