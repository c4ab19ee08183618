//! Installation state and the one-shot exit report
//!
//! There is exactly one active leak source per process. Whichever surface
//! installs first (the `#[global_allocator]` wrapper on its first tracked
//! allocation, or the preload shim from its constructor) fixes the source and
//! the configuration for the rest of the process's life. Later install calls
//! are no-ops.
//!
//! The exit report is registered with `atexit`, so it runs on a normal return
//! from `main` or a call to `exit`, and never after `_exit`, an abort or a
//! fatal signal.
//!
//! Installing also registers `pthread_atfork` handlers that hold every
//! registry lock across a `fork()`, so a child never inherits a lock owned by
//! a thread that did not survive the fork.

#![allow(unsafe_code)] // atexit

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::config::{Config, DEFAULT_LOG_FILTER, LOG_VAR};
use crate::guard::{self, SuppressionScope};
use crate::interception;
use crate::registry::LeakSource;
use crate::report::{self, LeakSummary};

struct Lifecycle {
    source: &'static dyn LeakSource,
    config: Config,
}

static LIFECYCLE: OnceLock<Lifecycle> = OnceLock::new();
static REPORTED: AtomicBool = AtomicBool::new(false);
/// Suppression state of the forking thread, saved by the prepare handler
static FORK_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Install `source` as the process's leak source
///
/// `config` is only evaluated by the call that actually installs. Returns
/// `true` for that call and `false` for every other.
pub fn install_with(source: &'static dyn LeakSource, config: impl FnOnce() -> Config) -> bool {
    if LIFECYCLE.get().is_some() {
        return false;
    }

    guard::suppressed(|| {
        let mut installed = false;
        let lifecycle = LIFECYCLE.get_or_init(|| {
            installed = true;
            Lifecycle { source, config: config() }
        });

        if installed {
            activate(&lifecycle.config);
        }
        installed
    })
}

fn activate(config: &Config) {
    interception::set_capture_depth(config.max_depth);

    // SAFETY: registering plain `extern "C" fn()`s with no captured state.
    let handlers = unsafe {
        libc::pthread_atfork(
            Some(prepare_fork as unsafe extern "C" fn()),
            Some(after_fork_in_parent as unsafe extern "C" fn()),
            Some(after_fork_in_child as unsafe extern "C" fn()),
        )
    };
    if handlers != 0 {
        warn!("Failed to register fork handlers, a forked child may block on the registry");
    }

    if config.report_at_exit {
        // SAFETY: registering a plain `extern "C" fn()` with no captured state.
        if unsafe { libc::atexit(report_at_exit) } != 0 {
            warn!("Failed to register exit handler, no leak report will be printed");
        }
    }

    info!(
        "Tracking allocations (max depth {}, exit report {}, symbolize {})",
        config.max_depth,
        if config.report_at_exit { "on" } else { "off" },
        if config.symbolize { "on" } else { "off" }
    );
}

#[must_use]
pub fn is_installed() -> bool {
    LIFECYCLE.get().is_some()
}

/// Configuration the process was installed with
#[must_use]
pub fn config() -> Option<Config> {
    LIFECYCLE.get().map(|lifecycle| lifecycle.config)
}

/// Number of live allocations in the installed source
#[must_use]
pub fn live_allocations() -> Option<usize> {
    LIFECYCLE.get().map(|lifecycle| guard::suppressed(|| lifecycle.source.count()))
}

/// Print the leak report now
///
/// Only the first call in the process prints; it returns the report's totals.
/// Returns `None` when nothing is installed or the report already ran.
pub fn report_now() -> Option<LeakSummary> {
    let lifecycle = LIFECYCLE.get()?;
    if REPORTED.swap(true, Ordering::AcqRel) {
        debug!("Leak report already written");
        return None;
    }
    Some(report::report_to_stderr(lifecycle.source, &lifecycle.config))
}

extern "C" fn report_at_exit() {
    report_now();
}

unsafe extern "C" fn prepare_fork() {
    let Some(lifecycle) = LIFECYCLE.get() else {
        return;
    };
    // Taking a contended lock may allocate; that must not re-enter the
    // registry while this thread holds some of its shards.
    let scope = SuppressionScope::enter();
    lifecycle.source.lock_for_fork();
    FORK_SUPPRESSED.store(scope.detach(), Ordering::Release);
}

unsafe extern "C" fn after_fork_in_parent() {
    let Some(lifecycle) = LIFECYCLE.get() else {
        return;
    };
    let previous = FORK_SUPPRESSED.load(Ordering::Acquire);
    // SAFETY: `prepare_fork` locked the source on this thread.
    unsafe { lifecycle.source.unlock_after_fork() };
    guard::resume(previous);
}

unsafe extern "C" fn after_fork_in_child() {
    let Some(lifecycle) = LIFECYCLE.get() else {
        return;
    };
    let previous = FORK_SUPPRESSED.load(Ordering::Acquire);
    // SAFETY: this is the child's only thread and `prepare_fork` locked the
    // source before the fork.
    unsafe { lifecycle.source.reset_after_fork() };
    guard::resume(previous);
}

/// Install `env_logger`, filtered by `HEAPPULSE_LOG`
///
/// Used by the preload shim, which has no host application to do it. Does
/// nothing if a logger is already installed.
pub fn init_logging() {
    guard::suppressed(|| {
        let env = env_logger::Env::new().filter_or(LOG_VAR, DEFAULT_LOG_FILTER);
        let _ = env_logger::Builder::from_env(env).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AllocationRegistry, SystemBookkeeping};
    use heappulse_common::{AllocationRecord, StackTrace};

    static SOURCE: AllocationRegistry = AllocationRegistry::new(SystemBookkeeping);
    static OTHER: AllocationRegistry = AllocationRegistry::new(SystemBookkeeping);

    // One test owns the process-wide state so ordering between tests cannot
    // change the outcome. With the preload shim linked in, its constructor has
    // installed the shim's registry before any test runs (covered in
    // `interception::preload`).
    #[cfg(not(feature = "preload"))]
    #[test]
    fn test_install_and_report_once() {
        let quiet = || Config { report_at_exit: false, symbolize: false, ..Config::default() };

        assert!(install_with(&SOURCE, quiet));
        assert!(is_installed());
        assert_eq!(config(), Some(quiet()));

        // a second source is ignored and its config never evaluated
        assert!(!install_with(&OTHER, || panic!("config evaluated twice")));

        SOURCE.insert(AllocationRecord::new(0x1000, 128, StackTrace::EMPTY));
        OTHER.insert(AllocationRecord::new(0x2000, 64, StackTrace::EMPTY));
        assert_eq!(live_allocations(), Some(1));

        let summary = report_now().expect("first report must run");
        assert_eq!(summary, LeakSummary { leaks: 1, bytes: 128 });
        assert_eq!(report_now(), None);
    }

    #[test]
    fn test_init_logging_is_repeatable() {
        init_logging();
        init_logging();
    }
}
