//! Debounced refresh of the reporting materialized views

use crate::AnalyticsStore;
use opsync_core::Result;
use opsync_shared::AnalyticsConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Refreshes the materialized views at most once per interval.
///
/// The checkpoint starts empty, so the first applied change after start-up
/// refreshes right away. It only advances when a refresh commits.
#[derive(Debug, Clone)]
pub struct FreshnessScheduler {
    interval: Duration,
    views: Vec<String>,
    last_refresh: Option<Instant>,
}

impl FreshnessScheduler {
    pub fn new(interval: Duration, views: Vec<String>) -> Self {
        Self {
            interval,
            views,
            last_refresh: None,
        }
    }

    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self::new(config.refresh_interval(), config.materialized_views.clone())
    }

    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    pub fn views(&self) -> &[String] {
        &self.views
    }

    /// Whether a refresh is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        }
    }

    /// Refresh if due. Returns whether a refresh ran.
    pub async fn maybe_refresh(&mut self, store: &dyn AnalyticsStore) -> Result<bool> {
        self.maybe_refresh_at(store, Instant::now()).await
    }

    pub async fn maybe_refresh_at(
        &mut self,
        store: &dyn AnalyticsStore,
        now: Instant,
    ) -> Result<bool> {
        if self.views.is_empty() || !self.is_due(now) {
            debug!("Materialized views are fresh, skipping refresh");
            return Ok(false);
        }

        info!(views = self.views.len(), "Refreshing materialized views");
        store.refresh_views(&self.views).await?;
        self.last_refresh = Some(now);
        Ok(true)
    }
}
