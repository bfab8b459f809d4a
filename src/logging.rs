//! Tracing subscriber setup for console output.
//!
//! Console output goes to stderr through `tracing-subscriber`'s fmt layer;
//! the per-run store log (gzipped, rotated) is written separately by
//! [`crate::store::RunLog`] so that it exists on whatever filesystem holds
//! the store, not the operator's machine cache.

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Verbosity: `debug` level when `verbose` is set, `info` otherwise; either
/// way the `HOSTCONF_LOG` environment variable takes precedence so a single
/// module can be turned up without recompiling.
///
/// Safe to call once per process; a second call is a no-op (the global
/// default can only be set once).
pub fn init_subscriber(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("HOSTCONF_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Format a UTC timestamp as `YYYYMMDDhhmmss` for store log file names.
///
/// Lexicographic order of the result equals chronological order, which the
/// store's log rotation relies on.
#[must_use]
pub fn utc_log_stamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}
