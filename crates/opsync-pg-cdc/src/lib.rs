//! PostgreSQL Change Data Capture for opsync

use opsync_analytics::{FreshnessScheduler, PgAnalyticsStore};
use opsync_core::{ChangeDecoder, Result};
use opsync_shared::OpsyncConfig;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod connection;
pub mod governor;
pub mod lock;
pub mod reclaim;
pub mod router;
pub mod session;
pub mod slot;
pub mod source;
pub mod stream;

pub use connection::*;
pub use governor::*;
pub use lock::*;
pub use reclaim::*;
pub use router::*;
pub use session::*;
pub use slot::*;
pub use source::*;
pub use stream::*;

/// PostgreSQL change data capture consumer wired to the analytical store
pub struct PgCdcConsumer {
    source_pool: PgPool,
    target_pool: PgPool,
    session: ReplicationSession,
}

impl PgCdcConsumer {
    /// Connect both databases and assemble the replication session
    pub async fn new(config: &OpsyncConfig) -> Result<Self> {
        let source_pool = connect_source(config).await?;
        let target_pool = connect_target(config).await?;
        Self::with_pools(config, source_pool, target_pool)
    }

    pub fn with_pools(
        config: &OpsyncConfig,
        source_pool: PgPool,
        target_pool: PgPool,
    ) -> Result<Self> {
        let replication = &config.replication;

        let control: Arc<dyn SlotControl> = Arc::new(PgSlotControl::new(source_pool.clone()));
        let connector = Arc::new(PgStreamConnector::new(&config.source)?);
        let reclaimer = SlotReclaimer::new(
            control.clone(),
            &replication.slot_name,
            &replication.output_plugin,
            &config.retry.reclaim,
        );

        let store = Arc::new(PgAnalyticsStore::new(
            target_pool.clone(),
            &config.analytics.schema,
        ));
        let source = Arc::new(PgOrderSource::new(
            source_pool.clone(),
            &replication.source_schema,
        ));
        let router = ChangeRouter::new(
            store,
            source,
            FreshnessScheduler::from_config(&config.analytics),
        );

        let session = ReplicationSession::new(
            SessionSettings::from_config(config),
            control,
            connector,
            reclaimer,
            ChangeDecoder::new(&replication.source_schema),
            router,
        );

        Ok(Self {
            source_pool,
            target_pool,
            session,
        })
    }

    /// Consume changes until the stream ends or a fatal error occurs
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting PostgreSQL CDC processing");
        let outcome = self.session.run().await;

        self.source_pool.close().await;
        self.target_pool.close().await;
        outcome
    }

    /// Health check for both databases
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.source_pool).await?;
        sqlx::query("SELECT 1").fetch_one(&self.target_pool).await?;
        Ok(())
    }

    pub fn session(&self) -> &ReplicationSession {
        &self.session
    }
}
