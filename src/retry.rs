//! Retry policy for pool operations.
//!
//! Retries live outside [`Pool`](crate::Pool) and
//! [`Connection`](crate::Connection): wrap the operation you want retried.
//!
//! # Example
//!
//! ```ignore
//! use mcp_pool::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! let result = policy
//!     .run(|| pool.invoke("search", json!({"q": "rust"}), timeout))
//!     .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default number of attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default cap on a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Default total retry budget.
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(30);

// ============================================================================
// RetryPolicy
// ============================================================================

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap on a single delay.
    pub max_backoff: Duration,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
    /// No retry is started once it would end past this budget.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: 2.0,
            max_elapsed: Some(DEFAULT_MAX_ELAPSED),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` attempts and default backoff.
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A policy that runs the operation once.
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Sets the first delay.
    #[inline]
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the delay cap.
    #[inline]
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Sets the growth factor.
    #[inline]
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the total budget. `None` removes it.
    #[inline]
    #[must_use]
    pub fn with_max_elapsed(mut self, budget: Option<Duration>) -> Self {
        self.max_elapsed = budget;
        self
    }

    /// Delay after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        if !millis.is_finite() || millis >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs `operation`, retrying errors for which
    /// [`Error::is_recoverable`] holds.
    ///
    /// # Errors
    ///
    /// Returns the last error once it is not recoverable or the attempts
    /// or budget run out.
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(operation, Error::is_recoverable).await
    }

    /// Runs `operation`, retrying errors accepted by `should_retry`.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::run`].
    pub async fn run_if<F, Fut, T, P>(&self, mut operation: F, mut should_retry: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut(&Error) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !should_retry(&err) {
                debug!(error = %err, attempt, "Not retrying");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                debug!(error = %err, attempt, "Retry attempts exhausted");
                return Err(err);
            }

            let delay = self.backoff(attempt);
            if let Some(budget) = self.max_elapsed
                && started.elapsed() + delay > budget
            {
                debug!(error = %err, attempt, "Retry budget exhausted");
                return Err(err);
            }

            debug!(
                error = %err,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lost() -> Error {
        Error::connection_lost("server went away")
    }

    /// Fails `failures` times with `error`, then returns the attempt count.
    fn flaky(
        attempts: &Arc<AtomicU32>,
        failures: u32,
        error: fn() -> Error,
    ) -> impl FnMut() -> std::future::Ready<Result<u32>> {
        let attempts = Arc::clone(attempts);
        move || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures { Err(error()) } else { Ok(n) })
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), DEFAULT_MAX_BACKOFF);
        assert_eq!(policy.backoff(u32::MAX), DEFAULT_MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = RetryPolicy::default()
            .run(flaky(&attempts, 2, lost))
            .await
            .expect("recovered");

        assert_eq!(result, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_recoverable_error_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));

        let err = RetryPolicy::default()
            .run(flaky(&attempts, 5, || Error::unknown_tool("nope")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownTool { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));

        let err = RetryPolicy::new(3)
            .run(flaky(&attempts, 10, lost))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_stops_retries() {
        let attempts = Arc::new(AtomicU32::new(0));

        let err = RetryPolicy::new(10)
            .with_max_elapsed(Some(Duration::from_millis(250)))
            .run(flaky(&attempts, 10, lost))
            .await
            .unwrap_err();

        // Attempt 1 at 0ms, attempt 2 at 100ms; the next delay would end at 300ms.
        assert!(err.is_recoverable());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = RetryPolicy::default()
            .run_if(
                flaky(&attempts, 1, || Error::call(-32000, "busy", None)),
                |err| matches!(err, Error::Call { code: -32000, .. }),
            )
            .await
            .expect("recovered");

        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));

        assert!(RetryPolicy::no_retry().run(flaky(&attempts, 1, lost)).await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
