//! Retry policies and a small executor for bounded, fixed-delay retries

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy trait
pub trait RetryPolicy: Send + Sync {
    /// Whether the attempt with zero-based index `attempt` may be followed by
    /// another one.
    fn should_retry(&self, attempt: u32, error: &dyn std::error::Error) -> bool;
    fn delay(&self, attempt: u32) -> Duration;
    /// Total number of attempts allowed, including the first.
    fn max_attempts(&self) -> u32;
}

/// Fixed interval retry policy
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
    max_attempts: u32,
}

impl FixedInterval {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.delay(), config.max_attempts)
    }
}

impl RetryPolicy for FixedInterval {
    fn should_retry(&self, attempt: u32, _error: &dyn std::error::Error) -> bool {
        attempt + 1 < self.max_attempts
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Retry executor
pub struct RetryExecutor<P: RetryPolicy> {
    policy: P,
}

impl<P: RetryPolicy> RetryExecutor<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Execute an operation, retrying every failure the policy allows
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Execute an operation, retrying only failures accepted by `retryable`.
    /// Other failures are returned immediately as [`RetryError::Fatal`].
    pub async fn execute_if<F, Fut, T, E, R>(
        &self,
        mut operation: F,
        retryable: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) if !retryable(&error) => {
                    return Err(RetryError::Fatal(error));
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt, &error) {
                        warn!(
                            "Operation failed after {} attempts: {}",
                            attempt + 1,
                            error
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt + 1,
                            last: error,
                        });
                    }

                    let delay = self.policy.delay(attempt);
                    warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.policy.max_attempts(),
                        delay,
                        error
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Retry-specific errors
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Operation failed: {0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// The error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(error) => error,
        }
    }
}

/// Convenience function to create a fixed interval executor
pub fn fixed_interval(interval: Duration, max_attempts: u32) -> RetryExecutor<FixedInterval> {
    RetryExecutor::new(FixedInterval::new(interval, max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    #[tokio::test]
    async fn test_fixed_interval_success_after_retries() {
        let executor = fixed_interval(Duration::from_millis(1), 3);
        let attempt_count = AtomicU32::new(0);
        let counter = &attempt_count;

        let result = executor
            .execute(|| async move {
                let current = counter.fetch_add(1, Ordering::Relaxed);
                if current < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok("success")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_fixed_interval_ceiling_counts_every_attempt() {
        let executor = fixed_interval(Duration::from_millis(1), 2);
        let attempt_count = AtomicU32::new(0);
        let counter = &attempt_count;

        let result: Result<(), _> = executor
            .execute(|| async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(TestError::Transient)
            })
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 2, .. })));
        assert_eq!(attempt_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let executor = fixed_interval(Duration::from_millis(1), 5);
        let attempt_count = AtomicU32::new(0);
        let counter = &attempt_count;

        let result: Result<(), _> = executor
            .execute_if(
                || async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(TestError::Permanent)
                },
                |e| matches!(e, TestError::Transient),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(TestError::Permanent))));
        assert_eq!(attempt_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = FixedInterval::from_config(&RetryConfig::new(3, 1_000));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert!(policy.should_retry(1, &TestError::Transient));
        assert!(!policy.should_retry(2, &TestError::Transient));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let policy = FixedInterval::new(Duration::ZERO, 0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(0, &TestError::Transient));
    }
}
