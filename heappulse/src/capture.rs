//! Stack capture on the allocation path
//!
//! Walks the current thread's stack with `backtrace::trace_unsynchronized` and
//! copies return addresses into a fixed-capacity [`StackTrace`]. Nothing here
//! allocates; the unwinder may allocate internally the first time it runs
//! (loading unwind tables), which is why callers hold a
//! [`SuppressionScope`](crate::guard::SuppressionScope) around the capture.
//!
//! [`capture`] returns the stack as the unwinder sees it, starting inside the
//! unwinder and `capture` itself. The allocation hooks use [`capture_above`]
//! instead, which drops every frame that lies below a stack address taken in the
//! hook. Their traces start at the intercepted entry point (`malloc`, or the
//! Rust allocator shim), so even a small depth reaches the program's frames.

#![allow(unsafe_code)] // trace_unsynchronized is unsafe

use heappulse_common::{StackTrace, MAX_TRACE_DEPTH};

/// Capture up to `max_depth` return addresses, nearest frame first
///
/// `max_depth` is clamped to [`MAX_TRACE_DEPTH`]. If the stack is shallower
/// than requested the shorter trace is returned; its length is always
/// available through [`StackTrace::len`].
#[inline(never)]
#[must_use]
pub fn capture(max_depth: usize) -> StackTrace {
    capture_above(max_depth, 0)
}

/// Capture like [`capture`], skipping the innermost frames that sit at or
/// below `floor` on the stack
///
/// `floor` is the address of a local variable in the frame the trace should
/// start from. A `floor` of zero skips nothing, and so does a platform where
/// the unwinder cannot report a frame's stack address.
#[inline(never)]
#[must_use]
pub fn capture_above(max_depth: usize, floor: usize) -> StackTrace {
    let limit = max_depth.min(MAX_TRACE_DEPTH);
    let mut trace = StackTrace::EMPTY;
    if limit == 0 {
        return trace;
    }
    let mut below_floor = floor != 0;

    // SAFETY: `trace_unsynchronized` is only unsafe because the platform
    // unwinder may not be reentrant. The callback does not capture recursively
    // and the allocation hooks refuse to capture while a capture is already
    // running on this thread (see `guard`).
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if ip == 0 {
                return false;
            }
            if below_floor {
                let sp = frame.sp() as usize;
                if sp != 0 && sp <= floor {
                    return true;
                }
                below_floor = false;
            }
            trace.push(ip);
            trace.len() < limit
        });
    }

    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn descend(levels: usize, depth: usize) -> StackTrace {
        if levels == 0 {
            capture(depth)
        } else {
            // keep the recursion from being turned into a loop
            let trace = descend(levels - 1, depth);
            std::hint::black_box(trace)
        }
    }

    #[test]
    fn test_capture_respects_requested_depth() {
        let trace = descend(10, 4);
        assert_eq!(trace.len(), 4);
        assert_eq!(trace.frames().len(), 4);
    }

    #[test]
    fn test_capture_never_exceeds_capacity() {
        let trace = descend(MAX_TRACE_DEPTH + 8, usize::MAX);
        assert_eq!(trace.len(), MAX_TRACE_DEPTH);
    }

    #[test]
    fn test_zero_depth_is_empty() {
        assert!(capture(0).is_empty());
    }

    #[test]
    fn test_capture_is_nearest_first() {
        let shallow = descend(0, MAX_TRACE_DEPTH);
        let deep = descend(3, MAX_TRACE_DEPTH);

        // Both traces start inside `capture`, so the innermost frame matches
        // while the deeper call chain shows more `descend` frames below it.
        assert!(!shallow.is_empty());
        assert_eq!(shallow.frames()[0], deep.frames()[0]);
    }

    /// Both traces, taken from the same frame: unfiltered and above a local
    #[inline(never)]
    fn capture_both_ways() -> (StackTrace, StackTrace) {
        let marker = 0_u8;
        let floor = std::ptr::from_ref(std::hint::black_box(&marker)) as usize;
        let full = capture(MAX_TRACE_DEPTH);
        let above = capture_above(MAX_TRACE_DEPTH, floor);
        std::hint::black_box(&marker);
        (full, above)
    }

    #[test]
    fn test_capture_above_skips_inner_frames() {
        let (full, above) = capture_both_ways();
        assert!(above.len() >= 2);

        // the unwinder's innermost frame is gone
        assert!(!above.frames().contains(&full.frames()[0]));

        // the caller of `capture_both_ways` appears in both, with the inner
        // frames trimmed off the filtered one
        let caller = above.frames()[1];
        let position = full.frames().iter().position(|&ip| ip == caller);
        assert!(position.is_some_and(|p| p > 1), "caller not found past the inner frames");
    }

    #[test]
    fn test_zero_floor_skips_nothing() {
        // both start at the same frame inside the unwinder
        let plain = capture(MAX_TRACE_DEPTH);
        let unfiltered = capture_above(MAX_TRACE_DEPTH, 0);
        assert_eq!(plain.frames()[0], unfiltered.frames()[0]);
    }

    #[test]
    fn test_capture_has_no_null_frames() {
        let trace = capture(MAX_TRACE_DEPTH);
        assert!(trace.frames().iter().all(|&ip| ip != 0));
    }
}
