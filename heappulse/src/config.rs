//! Environment-driven settings
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `HEAPPULSE_MAX_DEPTH` | frames captured per allocation, 1..=16 | 16 |
//! | `HEAPPULSE_REPORT` | `0`/`off`/`false` disables the exit report | on |
//! | `HEAPPULSE_SYMBOLIZE` | `0`/`off`/`false` prints raw addresses | on |
//! | `HEAPPULSE_LOG` | `env_logger` filter (preload shim only) | `warn` |
//!
//! Settings are read once, at installation. A bad value never stops the host
//! process: [`Config::load`] logs it and keeps the default for that field.

use heappulse_common::MAX_TRACE_DEPTH;
use log::warn;

use crate::domain::ConfigError;

pub const MAX_DEPTH_VAR: &str = "HEAPPULSE_MAX_DEPTH";
pub const REPORT_VAR: &str = "HEAPPULSE_REPORT";
pub const SYMBOLIZE_VAR: &str = "HEAPPULSE_SYMBOLIZE";
pub const LOG_VAR: &str = "HEAPPULSE_LOG";

/// Filter used when `HEAPPULSE_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Frames captured per allocation
    pub max_depth: usize,
    /// Print the leak report when the process exits
    pub report_at_exit: bool,
    /// Resolve frames to symbols in the report
    pub symbolize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: MAX_TRACE_DEPTH,
            report_at_exit: true,
            symbolize: true,
        }
    }
}

impl Config {
    /// Strict parse; the first invalid value is returned as an error
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_depth: lookup(MAX_DEPTH_VAR)
                .map_or(Ok(defaults.max_depth), |v| parse_depth(MAX_DEPTH_VAR, &v))?,
            report_at_exit: lookup(REPORT_VAR)
                .map_or(Ok(defaults.report_at_exit), |v| parse_switch(REPORT_VAR, &v))?,
            symbolize: lookup(SYMBOLIZE_VAR)
                .map_or(Ok(defaults.symbolize), |v| parse_switch(SYMBOLIZE_VAR, &v))?,
        })
    }

    /// Parse the process environment, replacing every invalid value with its
    /// default
    #[must_use]
    pub fn load() -> Self {
        Self::load_from(|name| std::env::var(name).ok())
    }

    pub(crate) fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(MAX_DEPTH_VAR) {
            match parse_depth(MAX_DEPTH_VAR, &value) {
                Ok(depth) => config.max_depth = depth,
                Err(e) => warn!("{e}, using {}", config.max_depth),
            }
        }
        if let Some(value) = lookup(REPORT_VAR) {
            match parse_switch(REPORT_VAR, &value) {
                Ok(on) => config.report_at_exit = on,
                Err(e) => warn!("{e}, leaving exit report on"),
            }
        }
        if let Some(value) = lookup(SYMBOLIZE_VAR) {
            match parse_switch(SYMBOLIZE_VAR, &value) {
                Ok(on) => config.symbolize = on,
                Err(e) => warn!("{e}, leaving symbolization on"),
            }
        }

        config
    }
}

fn parse_depth(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let depth: usize = value.trim().parse().map_err(|_| ConfigError::NotANumber {
        var,
        value: value.to_string(),
    })?;

    if (1..=MAX_TRACE_DEPTH).contains(&depth) {
        Ok(depth)
    } else {
        Err(ConfigError::OutOfRange {
            var,
            value: depth,
            min: 1,
            max: MAX_TRACE_DEPTH,
        })
    }
}

fn parse_switch(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::NotASwitch {
            var,
            value: value.to_string(),
        }),
    }
}
