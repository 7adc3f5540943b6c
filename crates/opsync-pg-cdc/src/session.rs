//! Replication session lifecycle: exclusivity, slot takeover, streaming,
//! reconnects and guaranteed cleanup

use crate::governor::{FailureGovernor, RetryDecision};
use crate::lock::ProcessLock;
use crate::reclaim::SlotReclaimer;
use crate::router::ChangeRouter;
use crate::slot::SlotControl;
use crate::stream::{ChangeStream, RawRecord, StreamConnector, StreamOptions};
use opsync_core::{decode_text, truncate, ChangeDecoder, OpsyncError, Result, SkipReason};
use opsync_shared::{CdcMetrics, FixedInterval, OpsyncConfig, RetryConfig, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};

/// Longest payload excerpt written to the logs
const PAYLOAD_LOG_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub lock_path: PathBuf,
    pub stream: StreamOptions,
    /// Restarts after connection-level failures
    pub connection_retry: RetryConfig,
    /// Message failure budget per session cycle
    pub message_retry: RetryConfig,
}

impl SessionSettings {
    pub fn from_config(config: &OpsyncConfig) -> Self {
        Self {
            lock_path: PathBuf::from(&config.lock.path),
            stream: StreamOptions::from_config(&config.replication),
            connection_retry: config.retry.connection.clone(),
            message_retry: config.retry.message.clone(),
        }
    }
}

/// Counters for one session cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub records_seen: u64,
    pub changes_applied: u64,
    pub records_skipped: u64,
    pub apply_failures: u64,
}

/// Owns the consumer from lock acquisition to lock release.
pub struct ReplicationSession {
    settings: SessionSettings,
    control: Arc<dyn SlotControl>,
    connector: Arc<dyn StreamConnector>,
    reclaimer: SlotReclaimer,
    decoder: ChangeDecoder,
    router: ChangeRouter,
    stats: SessionStats,
}

impl ReplicationSession {
    pub fn new(
        settings: SessionSettings,
        control: Arc<dyn SlotControl>,
        connector: Arc<dyn StreamConnector>,
        reclaimer: SlotReclaimer,
        decoder: ChangeDecoder,
        router: ChangeRouter,
    ) -> Self {
        Self {
            settings,
            control,
            connector,
            reclaimer,
            decoder,
            router,
            stats: SessionStats::default(),
        }
    }

    /// Statistics of the current (or last) session cycle
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn router(&self) -> &ChangeRouter {
        &self.router
    }

    /// Run the consumer until the stream ends or a fatal error occurs.
    ///
    /// Fails immediately with [`OpsyncError::LockHeld`] when another consumer
    /// holds the exclusivity lock. The lock is released on every exit path.
    #[instrument(skip(self), fields(slot = %self.settings.stream.slot_name))]
    pub async fn run(&mut self) -> Result<()> {
        let mut lock = ProcessLock::new(&self.settings.lock_path);
        if !lock.try_acquire() {
            return Err(OpsyncError::LockHeld(
                self.settings.lock_path.display().to_string(),
            ));
        }

        let outcome = self.run_with_reconnect().await;
        lock.release();

        match &outcome {
            Ok(()) => info!("Replication session finished"),
            Err(e) => error!(error = %e, "Error in CDC processing"),
        }
        outcome
    }

    /// Start session cycles until one ends cleanly. Only connection-level
    /// failures start another cycle, within the connection retry budget.
    async fn run_with_reconnect(&mut self) -> Result<()> {
        let policy = FixedInterval::from_config(&self.settings.connection_retry);
        let mut attempt = 0;

        loop {
            let mut stream = None;
            let result = self.run_cycle(&mut stream).await;
            self.end_cycle(stream).await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_connection() => {
                    if !policy.should_retry(attempt, &e) {
                        return Err(OpsyncError::Connection(format!(
                            "Failed to connect to database after {} attempts: {}",
                            attempt + 1,
                            e
                        )));
                    }

                    let delay = policy.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts(),
                        error = %e,
                        "Database connection error, reconnecting in {:?}",
                        delay
                    );
                    CdcMetrics::session_restart();
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One session cycle. The opened stream is handed back through `slot` so
    /// the caller can close it whatever happens here.
    async fn run_cycle(&mut self, slot: &mut Option<Box<dyn ChangeStream>>) -> Result<()> {
        self.stats = SessionStats::default();
        let options = self.settings.stream.clone();

        let stream = slot.insert(self.connector.connect().await?);

        if !self.control.publication_exists(&options.publication).await? {
            return Err(OpsyncError::PublicationMissing(options.publication.clone()));
        }
        info!(publication = %options.publication, "Publication verified");

        self.reclaimer.reclaim().await?;

        if let Some(state) = self.control.slot_state(&options.slot_name).await? {
            if let Some(pid) = state.active_pid {
                return Err(OpsyncError::SlotStillActive {
                    slot: options.slot_name.clone(),
                    pid,
                });
            }
        }

        stream.start(&options).await?;

        let mut governor = FailureGovernor::from_config(&self.settings.message_retry);
        while let Some(record) = stream.next_record().await? {
            self.handle_record(&record, &mut governor).await?;
        }

        info!("Replication stream ended");
        Ok(())
    }

    /// Close the stream, then make one more pass at reclaiming the slot.
    async fn end_cycle(&mut self, stream: Option<Box<dyn ChangeStream>>) {
        if let Some(mut stream) = stream {
            stream.close().await;
        }

        if let Err(e) = self.reclaimer.reclaim().await {
            warn!(error = %e, "Error cleaning up replication slot");
        }

        let stats = self.stats;
        info!(
            records = stats.records_seen,
            applied = stats.changes_applied,
            skipped = stats.records_skipped,
            failed = stats.apply_failures,
            "Session cycle ended"
        );
    }

    /// Decode and apply one record. Only a failure the governor gives up on
    /// is returned.
    pub async fn handle_record(
        &mut self,
        record: &RawRecord,
        governor: &mut FailureGovernor,
    ) -> Result<()> {
        self.stats.records_seen += 1;

        let event = match self.decoder.classify(&record.payload) {
            Ok(event) => event,
            Err(reason) => {
                self.stats.records_skipped += 1;
                CdcMetrics::record_skipped(reason.label());
                let text = decode_text(&record.payload);
                let payload = truncate(&text, PAYLOAD_LOG_CHARS);
                match reason {
                    SkipReason::NotAChange => trace!(lsn = %record.lsn, payload, "Ignoring record"),
                    SkipReason::Malformed => {
                        warn!(lsn = %record.lsn, payload, "Skipping malformed change record")
                    }
                    _ => debug!(lsn = %record.lsn, reason = %reason, "Skipping change record"),
                }
                return Ok(());
            }
        };

        debug!(
            lsn = %record.lsn,
            table = event.entity.table(),
            operation = event.operation.as_str(),
            "Processing change"
        );

        match self.router.apply(&event).await {
            Ok(outcome) => {
                self.stats.changes_applied += 1;
                debug!(upserts = outcome.upserts, refreshed = outcome.refreshed, "Change applied");
                Ok(())
            }
            Err(err) => {
                self.stats.apply_failures += 1;
                CdcMetrics::apply_failed(event.entity.as_str());
                let text = decode_text(&record.payload);
                error!(
                    lsn = %record.lsn,
                    table = event.entity.table(),
                    operation = event.operation.as_str(),
                    payload = truncate(&text, PAYLOAD_LOG_CHARS),
                    error = %err,
                    "Error processing message"
                );
                // Connection loss ends the cycle; the reconnect loop owns it.
                if err.is_connection() {
                    return Err(err);
                }
                match governor.on_failure(&err).await {
                    RetryDecision::Retry => Ok(()),
                    RetryDecision::GiveUp => Err(err),
                }
            }
        }
    }
}
