//! Logical replication stream read from the slot over a dedicated connection

use async_trait::async_trait;
use bytes::Bytes;
use opsync_core::{OpsyncError, Result};
use opsync_shared::{DatabaseConfig, ReplicationConfig};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// One record delivered by the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// WAL position of the record
    pub lsn: String,
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(lsn: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            lsn: lsn.into(),
            payload: payload.into(),
        }
    }
}

/// Parameters for starting the stream
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub slot_name: String,
    pub publication: String,
    pub output_plugin: String,
    pub proto_version: u32,
    pub status_interval: Duration,
    pub poll_interval: Duration,
    pub batch_size: u32,
}

impl StreamOptions {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            slot_name: config.slot_name.clone(),
            publication: config.publication.clone(),
            output_plugin: config.output_plugin.clone(),
            proto_version: config.proto_version,
            status_interval: config.status_interval(),
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size,
        }
    }
}

/// A connection able to stream changes from a slot.
#[async_trait]
pub trait ChangeStream: Send {
    /// Begin streaming. The slot must exist.
    async fn start(&mut self, options: &StreamOptions) -> Result<()>;

    /// Next record, waiting for one to arrive. `None` once the stream has
    /// ended.
    async fn next_record(&mut self) -> Result<Option<RawRecord>>;

    /// Close the underlying connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens replication connections
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>>;
}

/// Connects to the source with a dedicated, non-pooled connection
pub struct PgStreamConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgStreamConnector {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| OpsyncError::Config(format!("Invalid source database URL: {}", e)))?
            .application_name("opsync-cdc");
        Ok(Self {
            options,
            connect_timeout: config.connect_timeout(),
        })
    }
}

#[async_trait]
impl StreamConnector for PgStreamConnector {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>> {
        let conn = timeout(self.connect_timeout, self.options.connect())
            .await
            .map_err(|_| {
                OpsyncError::Connection(format!(
                    "timed out after {:?} connecting for replication",
                    self.connect_timeout
                ))
            })??;
        debug!("Opened replication connection");
        Ok(Box::new(SlotChangeStream::new(conn)))
    }
}

/// Polls `pg_logical_slot_get_changes`, consuming what it reads.
pub struct SlotChangeStream {
    conn: Option<PgConnection>,
    options: Option<StreamOptions>,
    query: String,
    buffer: VecDeque<RawRecord>,
    records_read: u64,
    last_lsn: Option<String>,
    last_status: Instant,
}

impl SlotChangeStream {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn: Some(conn),
            options: None,
            query: String::new(),
            buffer: VecDeque::new(),
            records_read: 0,
            last_lsn: None,
            last_status: Instant::now(),
        }
    }

    async fn poll(&mut self) -> Result<usize> {
        let (Some(conn), Some(options)) = (self.conn.as_mut(), self.options.as_ref()) else {
            return Err(OpsyncError::Internal(
                "replication stream polled before start".to_string(),
            ));
        };

        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(&self.query)
            .bind(&options.slot_name)
            .bind(options.batch_size as i32)
            .fetch_all(&mut *conn)
            .await?;

        let count = rows.len();
        for (lsn, data) in rows {
            self.buffer.push_back(RawRecord::new(lsn, data));
        }
        Ok(count)
    }

    fn maybe_report_status(&mut self) {
        let Some(options) = &self.options else {
            return;
        };
        if self.last_status.elapsed() >= options.status_interval {
            info!(
                slot = %options.slot_name,
                records = self.records_read,
                lsn = self.last_lsn.as_deref().unwrap_or("-"),
                "Replication stream status"
            );
            self.last_status = Instant::now();
        }
    }
}

/// Slot read query. `test_decoding` gets options that keep the output to
/// the change lines the decoder understands.
fn changes_query(output_plugin: &str) -> String {
    let plugin_options = if output_plugin == "test_decoding" {
        ", 'include-xids', '0', 'skip-empty-xacts', '1'"
    } else {
        ""
    };
    format!(
        "SELECT lsn::text, convert_to(data, 'UTF8') FROM pg_logical_slot_get_changes($1, NULL, $2{})",
        plugin_options
    )
}

#[async_trait]
impl ChangeStream for SlotChangeStream {
    async fn start(&mut self, options: &StreamOptions) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(OpsyncError::Internal(
                "replication stream already closed".to_string(),
            ));
        };

        let plugin: Option<String> =
            sqlx::query_scalar("SELECT plugin::text FROM pg_replication_slots WHERE slot_name = $1")
                .bind(&options.slot_name)
                .fetch_optional(&mut *conn)
                .await?;

        match plugin {
            None => {
                return Err(OpsyncError::Database(format!(
                    "replication slot '{}' does not exist",
                    options.slot_name
                )))
            }
            Some(plugin) if plugin != options.output_plugin => {
                warn!(
                    slot = %options.slot_name,
                    plugin = %plugin,
                    expected = %options.output_plugin,
                    "Slot uses an unexpected output plugin"
                );
            }
            Some(_) => {}
        }

        self.query = changes_query(&options.output_plugin);
        self.options = Some(options.clone());
        self.last_status = Instant::now();

        info!(
            slot = %options.slot_name,
            publication = %options.publication,
            proto_version = options.proto_version,
            "Starting replication"
        );
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.records_read += 1;
                self.last_lsn = Some(record.lsn.clone());
                self.maybe_report_status();
                return Ok(Some(record));
            }

            if self.conn.is_none() {
                return Ok(None);
            }

            if self.poll().await? == 0 {
                self.maybe_report_status();
                let idle = self
                    .options
                    .as_ref()
                    .map(|o| o.poll_interval)
                    .unwrap_or_default();
                sleep(idle).await;
            }
        }
    }

    async fn close(&mut self) {
        self.buffer.clear();
        if let Some(conn) = self.conn.take() {
            match conn.close().await {
                Ok(()) => debug!("Closed replication connection"),
                Err(e) => warn!(error = %e, "Error closing replication connection"),
            }
        }
    }
}
