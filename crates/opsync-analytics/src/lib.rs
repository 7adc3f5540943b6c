//! Analytical store for opsync: idempotent fact and dimension upserts,
//! materialized view refresh, and reporting exports

use async_trait::async_trait;
use opsync_core::{CustomerDim, OpsyncError, OrderFact, ProductDim, Result};
use opsync_shared::{CdcMetrics, PerfTimer};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub mod export;
pub mod freshness;
pub mod reports;

#[cfg(test)]
mod testdb;

pub use export::*;
pub use freshness::*;
pub use reports::*;

/// Writes into the analytical store.
///
/// Every upsert is its own atomic unit: it either commits fully or leaves the
/// store untouched and returns the error.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn upsert_order_fact(&self, fact: &OrderFact) -> Result<()>;

    async fn upsert_customer(&self, customer: &CustomerDim) -> Result<()>;

    async fn upsert_product(&self, product: &ProductDim) -> Result<()>;

    /// Refresh the given views concurrently, all in one transaction.
    async fn refresh_views(&self, views: &[String]) -> Result<()>;
}

/// [`AnalyticsStore`] backed by the analytical PostgreSQL database
#[derive(Clone)]
pub struct PgAnalyticsStore {
    pool: PgPool,
    schema: String,
    statements: Statements,
}

#[derive(Clone)]
struct Statements {
    order_fact: String,
    customer: String,
    product: String,
}

impl Statements {
    fn new(schema: &str) -> Self {
        Self {
            order_fact: format!(
                "INSERT INTO {schema}.fact_orders \
                     (order_id, order_date, delivery_date, customer_id, product_id, status, quantity, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NOW()) \
                 ON CONFLICT (order_id, delivery_date) DO UPDATE SET \
                     order_date = EXCLUDED.order_date, \
                     customer_id = EXCLUDED.customer_id, \
                     product_id = COALESCE(EXCLUDED.product_id, fact_orders.product_id), \
                     status = EXCLUDED.status, \
                     quantity = COALESCE(EXCLUDED.quantity, fact_orders.quantity), \
                     updated_at = NOW()"
            ),
            customer: format!(
                "INSERT INTO {schema}.dim_customers \
                     (customer_id, customer_name, is_active, customer_address, updated_at) \
                 VALUES ($1, $2, $3, $4, NOW()) \
                 ON CONFLICT (customer_id) DO UPDATE SET \
                     customer_name = {name}, \
                     is_active = EXCLUDED.is_active, \
                     customer_address = {address}, \
                     updated_at = NOW()",
                name = keep_or_replace("dim_customers", "customer_name", 5),
                address = keep_or_replace("dim_customers", "customer_address", 5),
            ),
            product: format!(
                "INSERT INTO {schema}.dim_products \
                     (product_id, product_name, barcode, unity_price, is_active, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, NOW()) \
                 ON CONFLICT (product_id) DO UPDATE SET \
                     product_name = {name}, \
                     barcode = {barcode}, \
                     unity_price = EXCLUDED.unity_price, \
                     is_active = EXCLUDED.is_active, \
                     updated_at = NOW()",
                name = keep_or_replace("dim_products", "product_name", 6),
                barcode = keep_or_replace("dim_products", "barcode", 6),
            ),
        }
    }
}

/// Keep the stored value when `column` is listed in the text[] parameter
/// `$param`, take the incoming one otherwise.
fn keep_or_replace(table: &str, column: &str, param: usize) -> String {
    format!(
        "CASE WHEN '{column}' = ANY(${param}::text[]) \
         THEN {table}.{column} ELSE EXCLUDED.{column} END"
    )
}

impl PgAnalyticsStore {
    /// `schema` must already be a validated identifier.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        Self {
            statements: Statements::new(&schema),
            pool,
            schema,
        }
    }

    /// Commit on success, roll back and hand the error back otherwise.
    async fn finish<T>(
        tx: Transaction<'static, Postgres>,
        outcome: std::result::Result<T, sqlx::Error>,
        what: &str,
    ) -> Result<T> {
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "Error upserting {}", what);
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl AnalyticsStore for PgAnalyticsStore {
    #[instrument(skip(self, fact), fields(order_id = fact.order_id, delivery_date = %fact.delivery_date))]
    async fn upsert_order_fact(&self, fact: &OrderFact) -> Result<()> {
        let _timer = PerfTimer::new("opsync_upsert_duration_seconds").with_label("table", "fact_orders");

        let mut tx = self.pool.begin().await?;
        let outcome = sqlx::query(&self.statements.order_fact)
            .bind(fact.order_id)
            .bind(fact.order_date)
            .bind(fact.delivery_date)
            .bind(fact.customer_id)
            .bind(fact.product_id)
            .bind(&fact.status)
            .bind(fact.quantity)
            .execute(&mut *tx)
            .await;
        Self::finish(tx, outcome, "order fact").await?;

        debug!("Upserted order fact");
        Ok(())
    }

    #[instrument(skip(self, customer), fields(customer_id = customer.customer_id))]
    async fn upsert_customer(&self, customer: &CustomerDim) -> Result<()> {
        let _timer =
            PerfTimer::new("opsync_upsert_duration_seconds").with_label("table", "dim_customers");

        let mut tx = self.pool.begin().await?;
        let outcome = sqlx::query(&self.statements.customer)
            .bind(customer.customer_id)
            .bind(&customer.customer_name)
            .bind(customer.is_active)
            .bind(&customer.address)
            .bind(customer.preserved.as_slice())
            .execute(&mut *tx)
            .await;
        Self::finish(tx, outcome, "customer").await?;

        debug!("Upserted customer");
        Ok(())
    }

    #[instrument(skip(self, product), fields(product_id = product.product_id))]
    async fn upsert_product(&self, product: &ProductDim) -> Result<()> {
        let _timer =
            PerfTimer::new("opsync_upsert_duration_seconds").with_label("table", "dim_products");

        let mut tx = self.pool.begin().await?;
        let outcome = sqlx::query(&self.statements.product)
            .bind(product.product_id)
            .bind(&product.product_name)
            .bind(&product.barcode)
            .bind(product.unit_price)
            .bind(product.is_active)
            .bind(product.preserved.as_slice())
            .execute(&mut *tx)
            .await;
        Self::finish(tx, outcome, "product").await?;

        debug!("Upserted product");
        Ok(())
    }

    async fn refresh_views(&self, views: &[String]) -> Result<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        for view in views {
            let statement = format!(
                "REFRESH MATERIALIZED VIEW CONCURRENTLY {}.{}",
                self.schema, view
            );
            if let Err(e) = sqlx::query(&statement).execute(&mut *tx).await {
                error!(view = %view, error = %e, "Error refreshing materialized views");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                return Err(match OpsyncError::from(e) {
                    OpsyncError::Connection(message) => OpsyncError::Connection(message),
                    other => OpsyncError::Refresh(format!("{}: {}", view, other)),
                });
            }
        }
        tx.commit().await?;

        CdcMetrics::views_refreshed(views.len(), started.elapsed());
        info!(views = views.len(), "Materialized views refreshed successfully");
        Ok(())
    }
}
