//! Canned reporting queries over the analytical store

use crate::export::Tabular;
use chrono::NaiveDate;
use opsync_core::{OpsyncError, Result};
use opsync_shared::{AnalyticsConfig, CdcMetrics};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// The four reports offered to analysts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    OpenOrders,
    TopDeliveryDates,
    PendingItems,
    TopCustomers,
}

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        ReportKind::OpenOrders,
        ReportKind::TopDeliveryDates,
        ReportKind::PendingItems,
        ReportKind::TopCustomers,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReportKind::OpenOrders => "open-orders",
            ReportKind::TopDeliveryDates => "top-delivery-dates",
            ReportKind::PendingItems => "pending-items",
            ReportKind::TopCustomers => "top-customers",
        }
    }

    /// CSV file written when no output path is given
    pub fn default_output(&self) -> &'static str {
        match self {
            ReportKind::OpenOrders => "open_orders.csv",
            ReportKind::TopDeliveryDates => "top_delivery_dates.csv",
            ReportKind::PendingItems => "pending_items.csv",
            ReportKind::TopCustomers => "top_customers.csv",
        }
    }

    /// Query text against `schema`, which must be a validated identifier.
    pub fn sql(&self, schema: &str) -> String {
        match self {
            ReportKind::OpenOrders => format!(
                "SELECT delivery_date::date AS delivery_date, status::text AS status, \
                        COUNT(*) AS order_count \
                 FROM {schema}.fact_orders \
                 WHERE status IN ('PENDING', 'PROCESSING') \
                 GROUP BY delivery_date, status \
                 ORDER BY delivery_date, status"
            ),
            ReportKind::TopDeliveryDates => format!(
                "SELECT delivery_date::date AS delivery_date, COUNT(*) AS order_count \
                 FROM {schema}.fact_orders \
                 WHERE status IN ('PENDING', 'PROCESSING') \
                 GROUP BY delivery_date \
                 ORDER BY order_count DESC \
                 LIMIT 3"
            ),
            ReportKind::PendingItems => format!(
                "SELECT product_id::bigint AS product_id, \
                        SUM(quantity)::bigint AS pending_quantity \
                 FROM {schema}.fact_orders \
                 WHERE status IN ('PENDING', 'PROCESSING') \
                 GROUP BY product_id \
                 ORDER BY product_id"
            ),
            ReportKind::TopCustomers => format!(
                "SELECT c.customer_id::bigint AS customer_id, \
                        c.customer_name::text AS customer_name, \
                        COUNT(*) AS pending_order_count \
                 FROM {schema}.fact_orders o \
                 JOIN {schema}.dim_customers c ON o.customer_id = c.customer_id \
                 WHERE o.status IN ('PENDING', 'PROCESSING') \
                 GROUP BY c.customer_id, c.customer_name \
                 ORDER BY pending_order_count DESC \
                 LIMIT 3"
            ),
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct OpenOrdersRow {
    pub delivery_date: NaiveDate,
    pub status: String,
    pub order_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DeliveryDateRow {
    pub delivery_date: NaiveDate,
    pub order_count: i64,
}

/// Header-only fact rows carry no product, so both columns may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PendingItemRow {
    pub product_id: Option<i64>,
    pub pending_quantity: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct TopCustomerRow {
    pub customer_id: i64,
    pub customer_name: String,
    pub pending_order_count: i64,
}

fn optional(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl Tabular for OpenOrdersRow {
    fn headers() -> &'static [&'static str] {
        &["delivery_date", "status", "order_count"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.delivery_date.to_string(),
            self.status.clone(),
            self.order_count.to_string(),
        ]
    }
}

impl Tabular for DeliveryDateRow {
    fn headers() -> &'static [&'static str] {
        &["delivery_date", "order_count"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.delivery_date.to_string(), self.order_count.to_string()]
    }
}

impl Tabular for PendingItemRow {
    fn headers() -> &'static [&'static str] {
        &["product_id", "pending_quantity"]
    }

    fn row(&self) -> Vec<String> {
        vec![optional(self.product_id), optional(self.pending_quantity)]
    }
}

impl Tabular for TopCustomerRow {
    fn headers() -> &'static [&'static str] {
        &["customer_id", "customer_name", "pending_order_count"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.customer_id.to_string(),
            self.customer_name.clone(),
            self.pending_order_count.to_string(),
        ]
    }
}

/// Runs reports with a server-side statement timeout
pub struct ReportRunner {
    pool: PgPool,
    schema: String,
    statement_timeout: Duration,
}

impl ReportRunner {
    pub fn new(pool: PgPool, schema: impl Into<String>, statement_timeout: Duration) -> Self {
        Self {
            pool,
            schema: schema.into(),
            statement_timeout,
        }
    }

    pub fn from_config(pool: PgPool, config: &AnalyticsConfig) -> Self {
        Self::new(pool, config.schema.clone(), config.statement_timeout())
    }

    pub async fn open_orders(&self) -> Result<Vec<OpenOrdersRow>> {
        self.fetch(ReportKind::OpenOrders).await
    }

    pub async fn top_delivery_dates(&self) -> Result<Vec<DeliveryDateRow>> {
        self.fetch(ReportKind::TopDeliveryDates).await
    }

    pub async fn pending_items(&self) -> Result<Vec<PendingItemRow>> {
        self.fetch(ReportKind::PendingItems).await
    }

    pub async fn top_customers(&self) -> Result<Vec<TopCustomerRow>> {
        self.fetch(ReportKind::TopCustomers).await
    }

    /// Run `kind` and decode its rows. Zero rows is an error.
    #[instrument(skip(self), fields(report = %kind))]
    pub async fn fetch<T>(&self, kind: ReportKind) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let started = Instant::now();
        let sql = kind.sql(&self.schema);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&statement_timeout_sql(self.statement_timeout))
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query_as::<_, T>(&sql).fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        if rows.is_empty() {
            return Err(OpsyncError::EmptyResult(kind.name().to_string()));
        }

        let elapsed = started.elapsed();
        CdcMetrics::report_executed(kind.name(), rows.len(), elapsed);
        info!(
            rows = rows.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Query executed"
        );
        debug!(query = %opsync_core::truncate(&sql, 200), "Report query");
        Ok(rows)
    }
}

fn statement_timeout_sql(timeout: Duration) -> String {
    format!("SET LOCAL statement_timeout = {}", timeout.as_millis())
}
