//! `opsync` command line: runs the change data capture consumer and the
//! canned analytical reports.

#![deny(missing_docs)]

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use opsync_analytics::{export_csv, ReportKind, ReportRunner, Tabular};
use opsync_pg_cdc::{connect_target, PgCdcConsumer};
use opsync_shared::OpsyncConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// opsync - keeps the analytical store in step with the operational database.
#[derive(Debug, Parser)]
#[command(name = "opsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file. Missing files fall back to defaults and
    /// `OPSYNC__*` environment variables.
    #[arg(long, short, env = "OPSYNC_CONFIG", default_value = "opsync.toml")]
    pub config: PathBuf,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Load the layered configuration.
    pub fn load_config(&self) -> anyhow::Result<OpsyncConfig> {
        OpsyncConfig::load_from_file(&self.config)
            .with_context(|| format!("loading configuration from {}", self.config.display()))
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream changes from the operational database into the analytical store.
    Consume,
    /// Run a report against the analytical store and export it as CSV.
    Report(ReportArgs),
}

/// Arguments of `opsync report`.
#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Report to run.
    #[arg(value_enum)]
    pub report: ReportName,

    /// Destination CSV file. Defaults to a per-report file name.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

/// Report names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportName {
    /// Open orders by delivery date and status.
    OpenOrders,
    /// The three delivery dates with the most open orders.
    TopDeliveryDates,
    /// Pending quantity per product.
    PendingItems,
    /// The three customers with the most pending orders.
    TopCustomers,
}

impl From<ReportName> for ReportKind {
    fn from(name: ReportName) -> Self {
        match name {
            ReportName::OpenOrders => ReportKind::OpenOrders,
            ReportName::TopDeliveryDates => ReportKind::TopDeliveryDates,
            ReportName::PendingItems => ReportKind::PendingItems,
            ReportName::TopCustomers => ReportKind::TopCustomers,
        }
    }
}

impl ReportArgs {
    /// Where the CSV goes.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(ReportKind::from(self.report).default_output()))
    }
}

/// Result of an exported report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSummary {
    /// Records written.
    pub records: usize,
    /// File written to.
    pub output: PathBuf,
}

/// Run the CDC consumer until it stops.
pub async fn run_consume(config: &OpsyncConfig) -> anyhow::Result<()> {
    let mut consumer = PgCdcConsumer::new(config)
        .await
        .context("connecting the CDC consumer")?;
    consumer.run().await.context("CDC processing stopped")?;
    Ok(())
}

/// Run one report and export it.
pub async fn run_report(args: &ReportArgs, config: &OpsyncConfig) -> anyhow::Result<ReportSummary> {
    let kind = ReportKind::from(args.report);
    let output = args.output_path();
    info!(report = %kind, output = %output.display(), "Running report");

    let pool = connect_target(config).await?;
    let runner = ReportRunner::from_config(pool.clone(), &config.analytics);

    let records = match kind {
        ReportKind::OpenOrders => export(runner.open_orders().await?, &output)?,
        ReportKind::TopDeliveryDates => export(runner.top_delivery_dates().await?, &output)?,
        ReportKind::PendingItems => export(runner.pending_items().await?, &output)?,
        ReportKind::TopCustomers => export(runner.top_customers().await?, &output)?,
    };
    pool.close().await;

    Ok(ReportSummary { records, output })
}

fn export<T: Tabular>(rows: Vec<T>, output: &Path) -> anyhow::Result<usize> {
    export_csv(&rows, output).with_context(|| format!("writing {}", output.display()))
}
