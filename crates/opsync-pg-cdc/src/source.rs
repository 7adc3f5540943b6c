//! Reads back the operational state needed to rebuild facts

use async_trait::async_trait;
use opsync_core::{OrderLine, Result};
use sqlx::PgPool;

/// Read access to the operational (source) tables
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Every current line item of an order, joined with its header.
    async fn order_lines(&self, order_id: i64) -> Result<Vec<OrderLine>>;
}

pub struct PgOrderSource {
    pool: PgPool,
    query: String,
}

impl PgOrderSource {
    /// `schema` must already be a validated identifier.
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            query: order_lines_query(schema),
        }
    }
}

fn order_lines_query(schema: &str) -> String {
    format!(
        "SELECT oi.order_id::bigint AS order_id, \
                oi.product_id::bigint AS product_id, \
                oi.quanity::int AS quantity, \
                o.order_date::date AS order_date, \
                o.delivery_date::date AS delivery_date, \
                o.customer_id::bigint AS customer_id, \
                o.status::text AS status \
         FROM {schema}.order_items oi \
         JOIN {schema}.orders o ON o.order_id = oi.order_id \
         WHERE oi.order_id = $1 \
         ORDER BY oi.product_id"
    )
}

#[async_trait]
impl OrderSource for PgOrderSource {
    async fn order_lines(&self, order_id: i64) -> Result<Vec<OrderLine>> {
        let lines = sqlx::query_as::<_, OrderLine>(&self.query)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_targets_source_schema() {
        let query = order_lines_query("operations");
        assert!(query.contains("FROM operations.order_items oi"));
        assert!(query.contains("JOIN operations.orders o ON o.order_id = oi.order_id"));
        assert!(query.contains("oi.quanity::int AS quantity"));
        assert!(query.contains("WHERE oi.order_id = $1"));
    }
}
