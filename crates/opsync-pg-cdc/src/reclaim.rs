//! Forced takeover of the well-known replication slot

use crate::slot::SlotControl;
use opsync_core::{OpsyncError, Result};
use opsync_shared::{CdcMetrics, FixedInterval, RetryConfig, RetryError, RetryExecutor, RetryPolicy};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

/// Outcome of a reclaim pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Backend that was holding the slot and got terminated
    pub terminated_pid: Option<i32>,
    /// Whether a pre-existing slot was dropped
    pub dropped: bool,
}

/// Evicts whoever holds the slot, then drops and recreates it.
///
/// Termination, drop and create each get at most `max_attempts` tries with a
/// fixed pause between them.
pub struct SlotReclaimer {
    control: Arc<dyn SlotControl>,
    slot_name: String,
    output_plugin: String,
    executor: RetryExecutor<FixedInterval>,
}

impl SlotReclaimer {
    pub fn new(
        control: Arc<dyn SlotControl>,
        slot_name: impl Into<String>,
        output_plugin: impl Into<String>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            control,
            slot_name: slot_name.into(),
            output_plugin: output_plugin.into(),
            executor: RetryExecutor::new(FixedInterval::from_config(retry)),
        }
    }

    #[instrument(skip(self), fields(slot = %self.slot_name))]
    pub async fn reclaim(&self) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();

        let state = self.control.slot_state(&self.slot_name).await?;
        if let Some(state) = &state {
            warn!(active_pid = ?state.active_pid, "Forcibly cleaning up replication slot");

            if let Some(pid) = state.active_pid {
                self.terminate(pid).await?;
                report.terminated_pid = Some(pid);
                // Give the terminated backend time to let go of the slot
                sleep(self.executor.policy().delay(0)).await;
            }

            self.drop_slot().await?;
            report.dropped = true;
        }

        self.create_slot().await?;

        CdcMetrics::slot_reclaimed(report.terminated_pid.is_some());
        info!(
            terminated_pid = ?report.terminated_pid,
            dropped = report.dropped,
            "Replication slot ready"
        );
        Ok(report)
    }

    async fn terminate(&self, pid: i32) -> Result<()> {
        let control = &self.control;
        let terminated = self
            .executor
            .execute(|| async move { control.terminate_backend(pid).await })
            .await
            .map_err(|e| self.reclaim_error("terminate backend", e))?;

        if terminated {
            info!(pid, "Terminated backend holding the replication slot");
        } else {
            info!(pid, "Backend already gone");
        }
        Ok(())
    }

    async fn drop_slot(&self) -> Result<()> {
        let control = &self.control;
        let slot = self.slot_name.as_str();
        self.executor
            .execute(|| async move { control.drop_slot(slot).await })
            .await
            .map_err(|e| self.reclaim_error("drop slot", e))?;
        info!("Dropped replication slot");
        Ok(())
    }

    async fn create_slot(&self) -> Result<()> {
        let control = &self.control;
        let slot = self.slot_name.as_str();
        let plugin = self.output_plugin.as_str();
        self.executor
            .execute(|| async move { control.create_slot(slot, plugin).await })
            .await
            .map_err(|e| self.reclaim_error("create slot", e))?;
        info!(plugin, "Created replication slot");
        Ok(())
    }

    /// Connection loss keeps its class so the session may reconnect; any
    /// other exhausted step is a reclaim failure.
    fn reclaim_error(&self, step: &str, err: RetryError<OpsyncError>) -> OpsyncError {
        let attempts = match &err {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal(_) => 1,
        };
        match err.into_inner() {
            OpsyncError::Connection(message) => OpsyncError::Connection(message),
            other => OpsyncError::SlotReclaim(format!(
                "{} '{}' failed after {} attempts: {}",
                step, self.slot_name, attempts, other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{MockSlotControl, SlotState};
    use mockall::Sequence;

    fn retry() -> RetryConfig {
        RetryConfig::new(3, 1)
    }

    fn held_by(pid: i32) -> SlotState {
        SlotState {
            slot_name: "cdc_slot".to_string(),
            active_pid: Some(pid),
        }
    }

    #[tokio::test]
    async fn test_reclaim_terminates_before_drop() {
        let mut control = MockSlotControl::new();
        let mut seq = Sequence::new();

        control
            .expect_slot_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(held_by(4242))));
        control
            .expect_terminate_backend()
            .withf(|pid| *pid == 4242)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        control
            .expect_drop_slot()
            .withf(|slot| slot == "cdc_slot")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        control
            .expect_create_slot()
            .withf(|slot, plugin| slot == "cdc_slot" && plugin == "test_decoding")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        let report = reclaimer.reclaim().await.unwrap();

        assert_eq!(report.terminated_pid, Some(4242));
        assert!(report.dropped);
    }

    #[tokio::test]
    async fn test_missing_slot_is_only_created() {
        let mut control = MockSlotControl::new();
        control.expect_slot_state().returning(|_| Ok(None));
        control.expect_terminate_backend().never();
        control.expect_drop_slot().never();
        control
            .expect_create_slot()
            .times(1)
            .returning(|_, _| Ok(()));

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        let report = reclaimer.reclaim().await.unwrap();

        assert_eq!(report, ReclaimReport::default());
    }

    #[tokio::test]
    async fn test_idle_slot_is_dropped_without_termination() {
        let mut control = MockSlotControl::new();
        control.expect_slot_state().returning(|_| {
            Ok(Some(SlotState {
                slot_name: "cdc_slot".to_string(),
                active_pid: None,
            }))
        });
        control.expect_terminate_backend().never();
        control.expect_drop_slot().times(1).returning(|_| Ok(()));
        control.expect_create_slot().times(1).returning(|_, _| Ok(()));

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        let report = reclaimer.reclaim().await.unwrap();

        assert_eq!(report.terminated_pid, None);
        assert!(report.dropped);
    }

    #[tokio::test]
    async fn test_drop_attempts_are_bounded() {
        let mut control = MockSlotControl::new();
        control
            .expect_slot_state()
            .returning(|_| Ok(Some(held_by(7))));
        control.expect_terminate_backend().times(1).returning(|_| Ok(true));
        control.expect_drop_slot().times(3).returning(|_| {
            Err(OpsyncError::Database(
                "replication slot \"cdc_slot\" is active for PID 7".to_string(),
            ))
        });
        control.expect_create_slot().never();

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        let err = reclaimer.reclaim().await.unwrap_err();

        match err {
            OpsyncError::SlotReclaim(message) => assert!(message.contains("3 attempts")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_attempts_are_bounded() {
        let mut control = MockSlotControl::new();
        control
            .expect_slot_state()
            .returning(|_| Ok(Some(held_by(7))));
        control
            .expect_terminate_backend()
            .times(3)
            .returning(|_| Err(OpsyncError::Database("permission denied".to_string())));
        control.expect_drop_slot().never();

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        assert!(matches!(
            reclaimer.reclaim().await,
            Err(OpsyncError::SlotReclaim(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_loss_keeps_its_class() {
        let mut control = MockSlotControl::new();
        control
            .expect_slot_state()
            .returning(|_| Ok(Some(held_by(7))));
        control.expect_terminate_backend().returning(|_| Ok(false));
        control
            .expect_drop_slot()
            .returning(|_| Err(OpsyncError::Connection("server closed the connection".into())));

        let reclaimer = SlotReclaimer::new(Arc::new(control), "cdc_slot", "test_decoding", &retry());
        let err = reclaimer.reclaim().await.unwrap_err();
        assert!(err.is_connection());
    }
}
