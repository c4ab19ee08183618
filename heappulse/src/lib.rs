//! # HeapPulse - Runtime Memory-Leak Detector
//!
//! HeapPulse sits between a program and its allocator. Every allocation that
//! is still live is recorded together with the call stack that created it, and
//! when the process exits every allocation that was never released is printed
//! with its (symbolized) call path.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Host Program                              │
//! └───────────────┬──────────────────────────────┬──────────────────┘
//!                 │ request / resize             │ release
//!                 ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Interception Layer                           │
//! │  • LeakTracker: #[global_allocator] wrapper (Rust programs)     │
//! │  • preload: exported malloc/free/realloc (LD_PRELOAD)           │
//! └───────┬───────────────────┬──────────────────────┬──────────────┘
//!         │ forward           │ capture              │ insert / remove
//!         ▼                   ▼                      ▼
//!   real allocator     ┌──────────────┐     ┌──────────────────┐
//!                      │   Capturer   │     │     Registry     │
//!                      │ (backtrace)  │     │ (64 shards)      │
//!                      └──────────────┘     └────────┬─────────┘
//!                                                    │ snapshot (at exit)
//!                                                    ▼
//!                      ┌──────────────┐     ┌──────────────────┐
//!                      │  Symbolizer  │◀────│     Reporter     │──▶ stderr
//!                      │ (DWARF/dladdr)     └──────────────────┘
//!                      └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Allocation Path
//!
//! - [`interception`]: the two delivery surfaces and the hook logic they share
//! - [`capture`]: fixed-capacity stack capture
//! - [`registry`]: sharded map of live allocations
//! - [`guard`]: per-thread suppression so internal allocations are never
//!   tracked
//!
//! ### Exit Path
//!
//! - [`lifecycle`]: installation state and the one-shot exit report
//! - [`report`]: report formatting
//! - [`symbolization`]: addresses to function names and source locations
//!
//! ### Support
//!
//! - [`config`]: `HEAPPULSE_*` environment variables
//! - [`domain`]: error types and newtypes
//!
//! ## Usage
//!
//! For a Rust program, install the wrapper as the global allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: heappulse::LeakTracker = heappulse::LeakTracker::system();
//! ```
//!
//! For any dynamically linked program, build the shim and preload it:
//!
//! ```text
//! cargo build --release -p heappulse --features preload
//! LD_PRELOAD=target/release/libheappulse.so ./program
//! ```
//!
//! Build the program with debug info (`debug = true`) to get file and line
//! numbers in the report.

pub mod capture;
pub mod config;
pub mod domain;
pub mod guard;
pub mod interception;
pub mod lifecycle;
pub mod registry;
pub mod report;
pub mod symbolization;

pub use config::Config;
pub use heappulse_common::{AllocationRecord, StackTrace, MAX_TRACE_DEPTH};
pub use interception::global::LeakTracker;
pub use report::LeakSummary;
