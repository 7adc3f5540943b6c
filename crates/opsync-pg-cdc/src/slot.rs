//! Publication and replication slot administration on the source database

use async_trait::async_trait;
use opsync_core::Result;
use sqlx::PgPool;
use tracing::{debug, instrument};

/// Observed state of a replication slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub slot_name: String,
    /// Backend currently streaming from the slot, if any
    pub active_pid: Option<i32>,
}

/// Catalog queries and slot mutations the consumer needs on the source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlotControl: Send + Sync {
    async fn publication_exists(&self, publication: &str) -> Result<bool>;

    async fn slot_state(&self, slot: &str) -> Result<Option<SlotState>>;

    /// Ask the server to terminate a backend. `false` means no such backend.
    async fn terminate_backend(&self, pid: i32) -> Result<bool>;

    /// Drop the slot if it exists.
    async fn drop_slot(&self, slot: &str) -> Result<()>;

    async fn create_slot(&self, slot: &str, plugin: &str) -> Result<()>;
}

/// [`SlotControl`] over a regular (non-streaming) source pool
#[derive(Clone)]
pub struct PgSlotControl {
    pool: PgPool,
}

impl PgSlotControl {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SlotControl for PgSlotControl {
    #[instrument(skip(self))]
    async fn publication_exists(&self, publication: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)")
                .bind(publication)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn slot_state(&self, slot: &str) -> Result<Option<SlotState>> {
        let row: Option<(String, Option<i32>)> = sqlx::query_as(
            "SELECT slot_name::text, active_pid FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(slot)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(slot_name, active_pid)| SlotState {
            slot_name,
            active_pid,
        }))
    }

    async fn terminate_backend(&self, pid: i32) -> Result<bool> {
        let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;
        Ok(terminated)
    }

    async fn drop_slot(&self, slot: &str) -> Result<()> {
        let result = sqlx::query(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(slot)
        .execute(&self.pool)
        .await?;
        debug!(slot, dropped = result.rows_affected(), "Drop replication slot");
        Ok(())
    }

    async fn create_slot(&self, slot: &str, plugin: &str) -> Result<()> {
        sqlx::query("SELECT slot_name FROM pg_create_logical_replication_slot($1, $2)")
            .bind(slot)
            .bind(plugin)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
