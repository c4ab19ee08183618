//! Termination-time leak report
//!
//! ```text
//! [HeapPulse] 2 unfreed allocations:
//!
//! [HeapPulse]  Leak: 0x00005581a3c012a0 (128 bytes), stack depth: 3
//!     #0  0x00005581a2b4f1a4 heappulse::capture::capture at src/capture.rs:35:9
//!     #1  0x00005581a2b4e9c0 app::load_config at src/main.rs:12:5
//!     #2  0x00007f3a2b429d90 __libc_start_call_main+0x80 (libc.so.6)
//! ---------------------------------------------------------
//!
//! ...
//! [HeapPulse] Total: 192 bytes leaked in 2 allocations
//! ```
//!
//! Records are printed in snapshot order (newest first). The formatting is
//! generic over the output and the frame resolver, so the same code writes to
//! stderr at exit and into a buffer in tests.

use heappulse_common::AllocationRecord;
use log::debug;
use std::io::{self, Write};

use crate::config::Config;
use crate::domain::Address;
use crate::guard;
use crate::registry::LeakSource;
use crate::symbolization::{raw_address, RawAddresses, ResolveFrames, StackResolver};

const PREFIX: &str = "[HeapPulse]";
const SEPARATOR: &str = "---------------------------------------------------------";

/// Totals of a written report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakSummary {
    /// Number of unreleased allocations
    pub leaks: usize,
    /// Sum of their requested sizes
    pub bytes: usize,
}

impl LeakSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaks == 0
    }
}

/// Write the report for `records` to `out`
///
/// # Errors
/// Returns the first I/O error from `out`
pub fn write_report<W, R>(
    records: &[AllocationRecord],
    resolver: &mut R,
    out: &mut W,
) -> io::Result<LeakSummary>
where
    W: Write + ?Sized,
    R: ResolveFrames + ?Sized,
{
    if records.is_empty() {
        writeln!(out, "{PREFIX} No leaks detected.")?;
        return Ok(LeakSummary::default());
    }

    writeln!(out, "{PREFIX} {} unfreed allocations:", records.len())?;
    writeln!(out)?;

    let mut summary = LeakSummary::default();
    for record in records {
        let frames = record.stack.frames();
        writeln!(
            out,
            "{PREFIX}  Leak: {} ({} bytes), stack depth: {}",
            Address(record.address),
            record.size,
            frames.len()
        )?;

        let mut described = resolver.resolve(frames).into_iter();
        for (i, &ip) in frames.iter().enumerate() {
            let description = described.next().unwrap_or_else(|| raw_address(ip));
            writeln!(out, "    #{i:<2} {description}")?;
        }
        writeln!(out, "{SEPARATOR}")?;
        writeln!(out)?;

        summary.leaks += 1;
        summary.bytes = summary.bytes.saturating_add(record.size);
    }

    writeln!(
        out,
        "{PREFIX} Total: {} bytes leaked in {} allocations",
        summary.bytes, summary.leaks
    )?;
    Ok(summary)
}

/// Snapshot `source` and print the report to stderr
///
/// Runs with tracking suppressed on the calling thread, so the report's own
/// allocations (resolver caches, formatting) never show up in it. Errors
/// writing to stderr are logged and otherwise ignored.
pub fn report_to_stderr(source: &dyn LeakSource, config: &Config) -> LeakSummary {
    guard::suppressed(|| {
        let records = source.snapshot();
        debug!("Writing leak report for {} records", records.len());

        let mut stderr = io::stderr().lock();
        let result = if config.symbolize && !records.is_empty() {
            write_report(&records, &mut StackResolver::for_current_process(), &mut stderr)
        } else {
            write_report(&records, &mut RawAddresses, &mut stderr)
        };

        result.unwrap_or_else(|e| {
            debug!("Failed to write leak report: {e}");
            LeakSummary {
                leaks: records.len(),
                bytes: records.iter().map(|r| r.size).sum(),
            }
        })
    })
}
