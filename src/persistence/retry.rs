//! Retry with exponential backoff and jitter.
//!
//! Delay before retry `n` (0-indexed) is `base * 2^n * rand(0.5, 1.0)`,
//! capped at `max_delay`. Only errors the caller classifies as transient
//! are retried; anything else returns immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RecoveryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Upper bound of the delay before retry `attempt` (jitter never exceeds it)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay in `[0.5, 1.0] * ceiling(attempt)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        self.ceiling(attempt).mul_f64(jitter)
    }
}

/// Final error of an exhausted or non-retryable operation
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Total attempts made, including the first
    pub attempts: u32,
    pub error: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.error)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                let transient = classify(&error);
                if !transient || attempt >= policy.max_retries {
                    return Err(RetryFailure {
                        attempts: attempt + 1,
                        error,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_delay_bounds() {
        let p = policy();
        let mut last_ceiling = Duration::ZERO;
        for attempt in 0..8 {
            let ceiling = p.ceiling(attempt);
            assert!(ceiling >= last_ceiling);
            last_ceiling = ceiling;
            for _ in 0..20 {
                let d = p.delay_for(attempt);
                assert!(d <= ceiling);
                assert!(d >= ceiling / 2);
            }
        }
        assert_eq!(p.ceiling(0), Duration::from_millis(100));
        assert_eq!(p.ceiling(2), Duration::from_millis(400));
        assert_eq!(p.ceiling(3), Duration::from_millis(500)); // capped
        assert_eq!(p.ceiling(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(), WardenError::is_transient, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(WardenError::Timeout("probe".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&policy(), WardenError::is_transient, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WardenError::Validation("bad command".into())) }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.error, WardenError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_final_error() {
        let result: Result<(), _> = retry_with_backoff(&policy(), WardenError::is_transient, |n| async move {
            Err(WardenError::ConnectionRefused(format!("attempt {}", n)))
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.error.to_string(), "Connection refused: attempt 3");
    }
}
