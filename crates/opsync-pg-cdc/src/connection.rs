//! Database connection management

use opsync_core::{is_connection_error, OpsyncError, Result};
use opsync_shared::{
    DatabaseConfig, FixedInterval, OpsyncConfig, RetryConfig, RetryError, RetryExecutor,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// PostgreSQL connection manager
pub struct PgConnectionManager {
    name: &'static str,
    pool: PgPool,
}

impl PgConnectionManager {
    /// Connect a pool, retrying connection-class failures on a fixed schedule.
    /// Anything else (bad credentials, unknown database) fails at once.
    #[instrument(skip(config, retry))]
    pub async fn connect(
        name: &'static str,
        config: &DatabaseConfig,
        retry: &RetryConfig,
    ) -> Result<Self> {
        info!("Creating PostgreSQL connection pool");

        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| OpsyncError::Config(format!("Invalid {} database URL: {}", name, e)))?
            .application_name("opsync");

        let executor = RetryExecutor::new(FixedInterval::from_config(retry));
        let pool = executor
            .execute_if(
                || {
                    PgPoolOptions::new()
                        .max_connections(config.max_connections)
                        .acquire_timeout(config.connect_timeout())
                        .connect_with(options.clone())
                },
                is_connection_error,
            )
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, last } => OpsyncError::Connection(format!(
                    "Failed to connect to {} database after {} attempts: {}",
                    name, attempts, last
                )),
                RetryError::Fatal(err) => OpsyncError::from(err),
            })?;

        info!("Connected to {} database", name);
        Ok(Self { name, pool })
    }

    pub fn into_pool(self) -> PgPool {
        self.pool
    }

    /// Test database connectivity
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        debug!("Connection to {} database is healthy", self.name);
        Ok(())
    }

    /// Get database version
    pub async fn get_version(&self) -> Result<String> {
        let row = sqlx::query("SELECT version() AS version")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("version")?)
    }

    /// Check that the server is configured for logical decoding
    pub async fn is_logical_decoding_enabled(&self) -> Result<bool> {
        let level: String = sqlx::query_scalar("SHOW wal_level")
            .fetch_one(&self.pool)
            .await?;
        Ok(level.eq_ignore_ascii_case("logical"))
    }
}

/// Pool on the operational database. Warns when the server cannot serve
/// logical decoding.
pub async fn connect_source(config: &OpsyncConfig) -> Result<PgPool> {
    let manager =
        PgConnectionManager::connect("source", &config.source, &config.retry.connect).await?;
    match manager.is_logical_decoding_enabled().await {
        Ok(true) => {}
        Ok(false) => warn!("Source wal_level is not 'logical'"),
        Err(e) => warn!(error = %e, "Could not read source wal_level"),
    }
    Ok(manager.into_pool())
}

/// Pool on the analytical database
pub async fn connect_target(config: &OpsyncConfig) -> Result<PgPool> {
    let manager =
        PgConnectionManager::connect("target", &config.target, &config.retry.connect).await?;
    Ok(manager.into_pool())
}
