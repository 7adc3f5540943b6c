//! Bounds message-level failures within one replication session

use opsync_core::OpsyncError;
use opsync_shared::RetryConfig;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Pause has elapsed, continue with the next record
    Retry,
    /// Ceiling reached, stop the session
    GiveUp,
}

/// Counts failed messages for the session and decides when to stop.
///
/// The budget is shared by every message of the session: after `ceiling`
/// retried failures the next one ends the session, whichever messages failed.
#[derive(Debug, Clone)]
pub struct FailureGovernor {
    ceiling: u32,
    delay: Duration,
    failures: u32,
}

impl FailureGovernor {
    pub fn new(ceiling: u32, delay: Duration) -> Self {
        Self {
            ceiling: ceiling.max(1),
            delay,
            failures: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.delay())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure. Below the ceiling this pauses for the fixed delay
    /// and answers [`RetryDecision::Retry`]; at the ceiling it gives up.
    pub async fn on_failure(&mut self, err: &OpsyncError) -> RetryDecision {
        if self.failures >= self.ceiling {
            error!(
                failures = self.failures,
                error = %err,
                "Max retries reached, giving up"
            );
            return RetryDecision::GiveUp;
        }

        self.failures += 1;
        warn!(
            attempt = self.failures,
            max_attempts = self.ceiling,
            error = %err,
            "Retrying after {:?}",
            self.delay
        );
        sleep(self.delay).await;
        RetryDecision::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> OpsyncError {
        OpsyncError::Apply {
            entity: "Order".to_string(),
            message: "duplicate key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_gives_up_at_ceiling() {
        let mut governor = FailureGovernor::new(5, Duration::from_millis(1));

        for _ in 0..5 {
            assert_eq!(governor.on_failure(&failure()).await, RetryDecision::Retry);
        }
        assert_eq!(governor.on_failure(&failure()).await, RetryDecision::GiveUp);
        assert_eq!(governor.failures(), 5);
    }

    #[tokio::test]
    async fn test_zero_ceiling_still_allows_one_retry() {
        let mut governor = FailureGovernor::new(0, Duration::ZERO);
        assert_eq!(governor.on_failure(&failure()).await, RetryDecision::Retry);
        assert_eq!(governor.on_failure(&failure()).await, RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_fixed_delay() {
        let mut governor = FailureGovernor::from_config(&RetryConfig::new(5, 5_000));
        let started = tokio::time::Instant::now();
        governor.on_failure(&failure()).await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
