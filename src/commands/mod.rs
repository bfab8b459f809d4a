//! Thin command handlers dispatched from `main`.

pub mod apply;
pub mod discover;
pub mod validate;

use crate::cli::GlobalOpts;
use crate::concurrency::{CancelToken, RunContext};

/// Build the run context for one command invocation.
///
/// The limiter gets `--limit` permits when given, otherwise the machine's
/// available parallelism; the cancellation token is the one `main` wired
/// to SIGINT.
#[must_use]
pub fn run_context(global: &GlobalOpts, cancel: &CancelToken) -> RunContext {
    let permits = global.limit.unwrap_or_else(|| {
        std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
    });
    let mut ctx = RunContext::new().with_limit(permits);
    ctx = ctx.with_cancel(cancel.clone());
    ctx
}
