//! Structured error types for heappulse
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever reach the host process: initialization errors are fatal
//! before `main`, everything else is logged and degraded.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to locate the real allocator entry points
#[derive(Error, Debug)]
pub enum InitError {
    #[error("failed to hook {symbol}: real implementation not found")]
    SymbolNotFound { symbol: &'static str },
}

/// Invalid value in one of the `HEAPPULSE_*` environment variables
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid number")]
    NotANumber { var: &'static str, value: String },

    #[error("{var}={value} is out of range ({min}..={max})")]
    OutOfRange { var: &'static str, value: usize, min: usize, max: usize },

    #[error("{var}={value:?} is not a valid switch (expected on/off)")]
    NotASwitch { var: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum SymbolizationError {
    #[error("Failed to read {0}")]
    MemoryMapsUnavailable(PathBuf),

    #[error("Malformed memory map line: {0:?}")]
    MalformedMapLine(String),

    #[error("Failed to load debug info from {path}: {reason}")]
    ObjectLoadFailed { path: PathBuf, reason: String },
}
