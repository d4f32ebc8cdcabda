//! Retry Logic with Exponential Backoff
//!
//! Every store call made by the uploader and the fetcher goes through
//! [`run_with_retry`]. Transient failures (timeouts, dropped connections,
//! failed multi-gets) are retried with exponential backoff; everything else
//! returns on the first attempt.
//!
//! ## Schedule
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy (default)       │
//! │  - max_attempts: 3           │
//! │  - base_delay: 1s            │
//! │  - max_delay: 60s            │
//! │  - backoff_multiplier: 2.0   │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 1s  (base)
//!        └─→ Attempt 3: Wait 2s  (base * 2)
//! ```
//!
//! `max_attempts` counts attempts, not retries: a policy of 3 calls the
//! operation at most three times and sleeps at most twice.
//!
//! ## Giving Up
//!
//! When the last attempt fails, its error is returned unchanged. Callers tell
//! "gave up after retries" apart from "failed outright" by
//! [`ClientError::is_retryable`]: only retryable errors are ever retried.
//!
//! ## Examples
//!
//! ```ignore
//! use chunkhouse_client::retry::{run_with_retry, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let value = run_with_retry(&policy, "set", || async {
//!     store.set(&key, payload.clone()).await
//! })
//! .await?;
//! ```

use crate::error::{ClientError, Result};
use chunkhouse_observability::metrics::STORE_RETRIES_TOTAL;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// # Backoff Calculation
///
/// ```text
/// delay(i) = min(base_delay * multiplier^i, max_delay)
/// ```
///
/// where `i` is the 0-indexed number of the failed attempt. With `jitter`
/// on, each delay is scaled by a random factor in `[0.75, 1.25)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 0 behaves like 1
    pub max_attempts: usize,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,

    /// Randomize delays by ±25%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Policy that calls the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Attempts actually made, with 0 clamped to 1.
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay after failed attempt `attempt` (0-indexed), before jitter.
    ///
    /// ```ignore
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(0), Duration::from_secs(1));
    /// assert_eq!(policy.backoff(1), Duration::from_secs(2));
    /// ```
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos < 0.0 || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter {
            return delay;
        }
        let factor = 0.75 + rand::random::<f64>() * 0.5;
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// # Behavior
///
/// 1. Call the operation
/// 2. On success, return the value
/// 3. On a non-retryable error, return it immediately
/// 4. On a retryable error with attempts left, sleep `backoff(i)` and go to 1
/// 5. On a retryable error on the last attempt, return that error unchanged
pub async fn run_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                debug!(
                    operation = operation_name,
                    error = %err,
                    "Non-retryable error, giving up"
                );
                return Err(err);
            }
            Err(err) if attempt + 1 >= attempts => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %err,
                    "Max attempts exhausted, giving up"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable error, backing off"
                );
                STORE_RETRIES_TOTAL
                    .with_label_values(&[operation_name])
                    .inc();

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Whether an error returned by [`run_with_retry`] means retries ran out.
pub fn gave_up_after_retries(err: &ClientError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn transient() -> ClientError {
        ClientError::transient("test", "connection reset")
    }

    // ========================================================================
    // RetryPolicy - backoff calculation
    // ========================================================================

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10)); // Capped
        assert_eq!(policy.backoff(100), Duration::from_secs(10)); // Still capped
    }

    #[test]
    fn test_sub_millisecond_backoff_keeps_precision() {
        let policy = RetryPolicy::new(5, Duration::from_micros(250), Duration::from_millis(1));

        assert_eq!(policy.backoff(0), Duration::from_micros(250));
        assert_eq!(policy.backoff(1), Duration::from_micros(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1)); // Capped
    }

    #[test]
    fn test_zero_attempts_behaves_like_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(true);
        for _ in 0..100 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(750) && d < Duration::from_millis(1250));
        }
    }

    // ========================================================================
    // run_with_retry
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures_with_doubling_delays() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result = run_with_retry(&policy, "unit", || {
            let calls = Arc::clone(&calls);
            let stamps = Arc::clone(&stamps);
            async move {
                stamps.lock().unwrap().push(Instant::now());
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stamps = stamps.lock().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error_unchanged() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));

        let err = run_with_retry(&policy, "unit", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::transient("set", format!("attempt {n}")))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(gave_up_after_retries(&err));
        match err {
            ClientError::TransientIo { message, .. } => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let err = run_with_retry(&policy, "unit", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ClientError::Write {
                    key: "k".into(),
                    message: "NOAUTH".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!gave_up_after_retries(&err));
    }
}
