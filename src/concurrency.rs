//! Run-scoped concurrency substrate: permit limiter, task groups, batching.
//!
//! A run carries at most one [`Limiter`], an N-permit semaphore shared by
//! every task group in the process, so the permit count is a *global* bound
//! on concurrent work regardless of how many phases run at once. Nested
//! scopes replace the limiter (via [`RunContext::with_limit`]); they never
//! stack permit counts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};

use crate::error::HostError;

/// An N-permit counting semaphore.
///
/// Permits are acquired blocking and released by dropping the returned
/// [`Permit`] guard, so a panicking task cannot leak a permit.
#[derive(Debug)]
pub struct Limiter {
    permits: usize,
    available: Mutex<usize>,
    cv: Condvar,
}

impl Limiter {
    /// Create a limiter with `permits` permits (clamped to at least one).
    #[must_use]
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            available: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    /// Total permit count this limiter was created with.
    #[must_use]
    pub const fn permits(&self) -> usize {
        self.permits
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.cv.wait(&mut available);
        }
        *available -= 1;
        Permit { limiter: self }
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        self.cv.notify_one();
    }
}

/// RAII guard for one acquired permit.
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Cooperative cancellation flag shared across a run.
///
/// Long-running loops call [`is_cancelled`](Self::is_cancelled) (or
/// [`RunContext::check_cancelled`]) at I/O boundaries; SIGINT flips the
/// flag from the signal handler installed in `main`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Context of one engine run: the shared limiter and cancellation token.
///
/// Passed explicitly to every operation that spawns work or blocks on the
/// host, so the global-semaphore semantics are visible in signatures rather
/// than hidden in ambient state.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    limiter: Option<Arc<Limiter>>,
    cancel: CancelToken,
}

impl RunContext {
    /// Context without a limiter: concurrency is unbounded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context whose limiter has `permits` permits.
    ///
    /// The previous limiter (if any) is replaced, not stacked: the innermost
    /// scope's permit count is the only bound in effect.
    #[must_use]
    pub fn with_limit(&self, permits: usize) -> Self {
        Self {
            limiter: Some(Arc::new(Limiter::new(permits))),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a context driven by the given cancellation token (the
    /// SIGINT handler owns a clone).
    #[must_use]
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            limiter: self.limiter.clone(),
            cancel,
        }
    }

    /// The limiter in scope, if any.
    #[must_use]
    pub fn limiter(&self) -> Option<&Arc<Limiter>> {
        self.limiter.as_ref()
    }

    /// The run's cancellation token.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail with [`HostError::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Cancelled`] when the token is set.
    pub fn check_cancelled(&self) -> Result<(), HostError> {
        if self.cancel.is_cancelled() {
            Err(HostError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run every task, collecting each result into the slot matching its
/// submission order.
///
/// Each worker acquires a permit from the context's limiter (when one is in
/// scope) before running its task and releases it afterwards. Errors never
/// short-circuit the group: every task runs and every slot is filled;
/// cancellation is the tasks' own responsibility via the context.
///
/// With a limiter of `k` permits at most `min(tasks, k)` worker threads are
/// spawned; without one every task gets its own thread.
pub fn run_all<T, F>(ctx: &RunContext, tasks: Vec<F>) -> Vec<Result<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    let n = tasks.len();
    if n == 0 {
        return Vec::new();
    }

    let workers = ctx.limiter().map_or(n, |l| l.permits().min(n));
    let queue: Mutex<Vec<(usize, F)>> = Mutex::new(tasks.into_iter().enumerate().rev().collect());
    let slots: Vec<Mutex<Option<Result<T>>>> = (0..n).map(|_| Mutex::new(None)).collect();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let Some((index, task)) = queue.lock().pop() else {
                        return;
                    };
                    let _permit = ctx.limiter().map(|l| l.acquire());
                    let result = task();
                    *slots
                        .get(index)
                        .unwrap_or_else(|| panic!("task slot {index} out of range"))
                        .lock() = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .unwrap_or_else(|| panic!("task terminated without recording a result"))
        })
        .collect()
}

/// Collapse a group's per-task results into a single result.
///
/// All errors are reported, one per line, in submission order; no task's
/// failure is dropped.
///
/// # Errors
///
/// Returns an error when any task failed.
pub fn join_errors<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(format!("{e:#}")),
        }
    }
    if errors.is_empty() {
        Ok(values)
    } else {
        Err(anyhow::anyhow!(
            "{} task(s) failed:\n{}",
            errors.len(),
            errors.join("\n")
        ))
    }
}

/// Partition `items` into `min(|items|, permits)` contiguous, near-equal
/// batches.
///
/// The first `n mod k` batches receive `⌈n/k⌉` items and the remainder
/// `⌊n/k⌋`, so batch sizes differ by at most one. Without a limiter in
/// scope every item becomes its own batch.
///
/// # Examples
///
/// ```
/// use hostconf_cli::concurrency::{RunContext, batches};
///
/// let ctx = RunContext::new().with_limit(3);
/// let parts = batches(&ctx, (0..10).collect::<Vec<_>>());
/// let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
/// assert_eq!(sizes, vec![4, 3, 3]);
/// ```
#[must_use]
pub fn batches<T>(ctx: &RunContext, items: Vec<T>) -> Vec<Vec<T>> {
    let n = items.len();
    if n == 0 {
        return Vec::new();
    }
    let k = ctx.limiter().map_or(n, |l| l.permits().min(n));

    let base = n / k;
    let extra = n % k;
    let mut out: Vec<Vec<T>> = Vec::with_capacity(k);
    let mut iter = items.into_iter();
    for index in 0..k {
        let size = if index < extra { base + 1 } else { base };
        out.push(iter.by_ref().take(size).collect());
    }
    out
}
