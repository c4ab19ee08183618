//! # Shared Data Structures (Allocator Hooks ↔ Reporting)
//!
//! Defines the plain-data types that live inside the allocation registry. They
//! are created on the allocation hot path, so this crate is `#![no_std]` and
//! every type is `Copy`: a record can never own heap memory, which means storing
//! or copying one can never re-enter the allocator it is describing.
//!
//! ## Key Types
//!
//! - [`StackTrace`] - Fixed-capacity sequence of return addresses
//! - [`AllocationRecord`] - One live allocation (address, size, stack)

#![cfg_attr(not(test), no_std)]

use core::fmt;

// ============================================================================
// Capture Limits
// ============================================================================

/// Maximum number of return addresses stored per allocation
///
/// Every record carries an inline array of this many slots, so raising it
/// grows each registry entry by one word per frame.
pub const MAX_TRACE_DEPTH: usize = 16;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Call stack captured at allocation time, nearest frame first
///
/// The length is stored explicitly and never inferred from the capacity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackTrace {
    frames: [usize; MAX_TRACE_DEPTH],
    len: usize,
}

impl StackTrace {
    /// An empty trace (no frames captured)
    pub const EMPTY: Self = Self { frames: [0; MAX_TRACE_DEPTH], len: 0 };

    /// Build a trace from a slice of return addresses
    ///
    /// Addresses beyond [`MAX_TRACE_DEPTH`] are dropped.
    #[must_use]
    pub fn from_frames(frames: &[usize]) -> Self {
        let mut trace = Self::EMPTY;
        for &ip in frames.iter().take(MAX_TRACE_DEPTH) {
            trace.push(ip);
        }
        trace
    }

    /// Append a frame
    ///
    /// Returns `false` (and stores nothing) once the trace is full.
    pub fn push(&mut self, ip: usize) -> bool {
        match self.frames.get_mut(self.len) {
            Some(slot) => {
                *slot = ip;
                self.len += 1;
                true
            }
            None => false,
        }
    }

    /// Number of captured frames
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len == MAX_TRACE_DEPTH
    }

    /// Captured return addresses, nearest frame first
    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames().iter().map(|ip| Hex(*ip))).finish()
    }
}

struct Hex(usize);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Metadata for one allocation that has not been released yet
///
/// **Lifecycle**: created inside the intercepted allocation after the real
/// allocator succeeded, dropped by the matching release. Records that survive
/// until exit are what the leak report prints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Address returned to the caller (registry key)
    pub address: usize,

    /// Requested size in bytes
    pub size: usize,

    /// Call stack at the allocation site
    pub stack: StackTrace,

    /// Insertion stamp, strictly increasing across the process
    ///
    /// Assigned by the registry on insert. Snapshots are ordered by it so that
    /// the same registry state always produces the same report.
    pub sequence: u64,
}

impl AllocationRecord {
    /// Create a record that has not been stamped by a registry yet
    #[must_use]
    pub const fn new(address: usize, size: usize, stack: StackTrace) -> Self {
        Self { address, size, stack, sequence: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_trace_keeps_order() {
        let trace = StackTrace::from_frames(&[0x30, 0x20, 0x10]);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.frames(), &[0x30, 0x20, 0x10]);
    }

    #[test]
    fn test_stack_trace_truncates_at_capacity() {
        let many: [usize; MAX_TRACE_DEPTH + 4] = core::array::from_fn(|i| i + 1);
        let trace = StackTrace::from_frames(&many);

        assert!(trace.is_full());
        assert_eq!(trace.len(), MAX_TRACE_DEPTH);
        assert_eq!(trace.frames()[MAX_TRACE_DEPTH - 1], MAX_TRACE_DEPTH);
    }

    #[test]
    fn test_push_on_full_trace_is_rejected() {
        let mut trace = StackTrace::EMPTY;
        for ip in 0..MAX_TRACE_DEPTH {
            assert!(trace.push(ip));
        }
        assert!(!trace.push(0xdead));
        assert_eq!(trace.len(), MAX_TRACE_DEPTH);
    }

    #[test]
    fn test_empty_trace() {
        let trace = StackTrace::default();
        assert!(trace.is_empty());
        assert!(trace.frames().is_empty());
    }
}
