//! Exponential backoff for explicit, caller-driven retries.
//!
//! Nothing in the runtime retries on its own. Applications that want to
//! retry a failed request or a channel recovery wrap it here, choosing which
//! errors are worth another attempt.
//!
//! ```rust
//! use shardlink_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2))
//!     .build();
//!
//! let value = retry_with_predicate(
//!     policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("unavailable"),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff schedule.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0
/// - `jitter`: 0.2 (each delay varies by up to ±20%)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Relative random spread applied to each delay, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter:
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    ///
    /// Multipliers below `1.0` (or NaN) are treated as `1.0`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.multiplier.max(1.0);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) spread by the jitter
    /// factor, still capped at `max_delay`.
    #[must_use]
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = if self.jitter.is_nan() { 0.0 } else { self.jitter.clamp(0.0, 1.0) };
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor; `0.0` disables jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Retry `operation` on every error until it succeeds or the policy is
/// exhausted.
///
/// # Errors
///
/// Returns the last error once `max_retries` retries have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry `operation` while `is_retryable` accepts its error.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once
/// `max_retries` retries have failed.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if !is_retryable(&err) => {
                tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                return Err(err);
            },
            Err(err) if attempt >= policy.max_retries => {
                tracing::error!(attempt, error = %err, "Operation failed after max retries");
                return Err(err);
            },
            Err(err) => {
                let delay = policy.jittered_delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .jitter(0.0)
            .build()
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(1))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(2));
    }

    proptest::proptest! {
        #[test]
        fn delays_never_exceed_the_cap(
            attempt in 0usize..200,
            initial_ms in 1u64..10_000,
            max_ms in 1u64..60_000,
            multiplier in -4.0f64..16.0,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(max_ms))
                .multiplier(multiplier)
                .build();
            proptest::prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(max_ms));
            proptest::prop_assert!(policy.jittered_delay(attempt) <= Duration::from_millis(max_ms));
        }
    }

    #[test]
    fn shrinking_multipliers_keep_the_initial_delay() {
        for multiplier in [-2.0, 0.0, 0.5, f64::NAN] {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .multiplier(multiplier)
                .build();
            assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
            assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
            assert!(policy.jittered_delay(3) <= policy.max_delay);
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .jitter(0.5)
            .build();

        for _ in 0..100 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_with_backoff(fast(), || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(format!("attempt {n} failed")) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_with_backoff(RetryPolicy { max_retries: 2, ..fast() }, || {
            let calls = Arc::clone(&calls);
            async move { Err::<(), _>(format!("failure {}", calls.fetch_add(1, Ordering::SeqCst))) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_with_predicate(
            fast(),
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("permanent")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
