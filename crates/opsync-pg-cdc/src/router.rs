//! Routes decoded change events to analytical store writes

use crate::source::OrderSource;
use opsync_analytics::{AnalyticsStore, FreshnessScheduler};
use opsync_core::{
    ChangeEvent, CustomerDim, Entity, OpsyncError, OrderFact, ProductDim, Result,
};
use opsync_shared::CdcMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// What applying one event did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows upserted into the analytical store
    pub upserts: usize,
    /// Whether the materialized views were refreshed afterwards
    pub refreshed: bool,
}

/// Applies change events idempotently.
///
/// Order header changes upsert the header fact then rebuild the facts of
/// every line item; line item changes rebuild from the source; customer and
/// product changes upsert their dimension row. A successful apply gives the
/// freshness scheduler a chance to refresh the views.
pub struct ChangeRouter {
    store: Arc<dyn AnalyticsStore>,
    source: Arc<dyn OrderSource>,
    scheduler: FreshnessScheduler,
}

impl ChangeRouter {
    pub fn new(
        store: Arc<dyn AnalyticsStore>,
        source: Arc<dyn OrderSource>,
        scheduler: FreshnessScheduler,
    ) -> Self {
        Self {
            store,
            source,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &FreshnessScheduler {
        &self.scheduler
    }

    #[instrument(skip(self, event), fields(entity = %event.entity, operation = event.operation.as_str()))]
    pub async fn apply(&mut self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let started = Instant::now();
        let entity = event.entity.as_str();

        let upserts = match event.entity {
            Entity::Order => self.apply_order(event).await,
            Entity::OrderItem => self.apply_order_item(event).await,
            Entity::Customer => self.apply_customer(event).await,
            Entity::Product => self.apply_product(event).await,
        }
        .map_err(|e| OpsyncError::apply(entity, e))?;

        let refreshed = self.scheduler.maybe_refresh(self.store.as_ref()).await?;

        CdcMetrics::change_applied(entity, event.operation.as_str(), started.elapsed());
        Ok(ApplyOutcome { upserts, refreshed })
    }

    async fn apply_order(&self, event: &ChangeEvent) -> Result<usize> {
        let fact = OrderFact::from_order_fields(&event.fields)?;
        self.store.upsert_order_fact(&fact).await?;
        debug!(order_id = fact.order_id, "Order header upserted");

        let lines = self.cascade(fact.order_id).await?;
        Ok(1 + lines)
    }

    async fn apply_order_item(&self, event: &ChangeEvent) -> Result<usize> {
        let order_id: i64 = event.fields.parse("order_id")?;
        self.cascade(order_id).await
    }

    async fn apply_customer(&self, event: &ChangeEvent) -> Result<usize> {
        let customer = CustomerDim::from_fields(&event.fields)?;
        self.store.upsert_customer(&customer).await?;
        debug!(customer_id = customer.customer_id, "Customer upserted");
        Ok(1)
    }

    async fn apply_product(&self, event: &ChangeEvent) -> Result<usize> {
        let product = ProductDim::from_fields(&event.fields)?;
        self.store.upsert_product(&product).await?;
        debug!(product_id = product.product_id, "Product upserted");
        Ok(1)
    }

    /// Rebuild every fact row of an order from its current line items. Each
    /// line is upserted in its own transaction.
    async fn cascade(&self, order_id: i64) -> Result<usize> {
        let lines = self.source.order_lines(order_id).await?;
        let count = lines.len();

        for line in lines {
            let fact = OrderFact::from(line);
            self.store.upsert_order_fact(&fact).await?;
        }

        info!(order_id, rows = count, "Order facts rebuilt from line items");
        Ok(count)
    }
}
