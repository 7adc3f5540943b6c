//! Observability features: structured logging and Prometheus metrics

use metrics::{counter, histogram, Label};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Set once the subscriber and exporter are installed
static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Observability system for centralized logging and metrics
pub struct ObservabilitySystem;

impl ObservabilitySystem {
    /// Initialize the observability system. Must run inside a Tokio runtime
    /// when metrics are enabled.
    pub fn init(config: &ObservabilityConfig) -> anyhow::Result<()> {
        Self::init_logging(&config.logging)?;

        if config.metrics.enabled {
            Self::init_metrics(&config.metrics)?;
        }

        INITIALIZED
            .set(())
            .map_err(|_| anyhow::anyhow!("Observability system already initialized"))?;

        info!("Observability system initialized");
        Ok(())
    }

    /// Initialize structured logging
    fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
        let level = parse_level(&config.level);

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let registry = tracing_subscriber::registry().with(env_filter);

        match config.format.to_lowercase().as_str() {
            "json" => {
                let json_layer = tracing_subscriber::fmt::layer().json();
                registry.with(json_layer).try_init()?;
            }
            _ => {
                let pretty_layer = tracing_subscriber::fmt::layer().with_target(true);
                registry.with(pretty_layer).try_init()?;
            }
        }

        Ok(())
    }

    /// Initialize Prometheus metrics with its own scrape listener
    fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = config.bind_address.parse()?;

        PrometheusBuilder::new()
            .with_http_listener(bind_addr)
            .install()?;

        info!("Prometheus metrics listening on {}", bind_addr);
        Ok(())
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Metrics emitted by the change-data-capture consumer
pub struct CdcMetrics;

impl CdcMetrics {
    /// A change event was written to the analytical store
    pub fn change_applied(entity: &str, operation: &str, duration: Duration) {
        counter!("opsync_changes_applied_total",
                "entity" => entity.to_string(),
                "operation" => operation.to_string())
            .increment(1);
        histogram!("opsync_apply_duration_seconds", "entity" => entity.to_string())
            .record(duration.as_secs_f64());
    }

    /// A raw record produced no change event
    pub fn record_skipped(reason: &str) {
        counter!("opsync_records_skipped_total", "reason" => reason.to_string()).increment(1);
    }

    /// Applying a change failed
    pub fn apply_failed(entity: &str) {
        counter!("opsync_apply_failures_total", "entity" => entity.to_string()).increment(1);
    }

    /// The replication session is being restarted after a connection failure
    pub fn session_restart() {
        counter!("opsync_session_restarts_total").increment(1);
    }

    /// The replication slot was reclaimed
    pub fn slot_reclaimed(terminated_backend: bool) {
        let terminated = if terminated_backend { "true" } else { "false" };
        counter!("opsync_slot_reclaims_total", "terminated_backend" => terminated)
            .increment(1);
    }

    /// Materialized views were refreshed
    pub fn views_refreshed(count: usize, duration: Duration) {
        counter!("opsync_view_refreshes_total").increment(1);
        histogram!("opsync_view_refresh_duration_seconds").record(duration.as_secs_f64());
        histogram!("opsync_views_per_refresh").record(count as f64);
    }

    /// A report query finished
    pub fn report_executed(report: &str, rows: usize, duration: Duration) {
        histogram!("opsync_report_duration_seconds", "report" => report.to_string())
            .record(duration.as_secs_f64());
        histogram!("opsync_report_rows", "report" => report.to_string()).record(rows as f64);
    }
}

/// Records the elapsed time into a histogram when dropped
pub struct PerfTimer {
    start: Instant,
    metric_name: &'static str,
    labels: Vec<Label>,
}

impl PerfTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push(Label::new(key, value.into()));
        self
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let labels = std::mem::take(&mut self.labels);
            histogram!(self.metric_name, labels).record(self.start.elapsed().as_secs_f64());
        }
    }
}
