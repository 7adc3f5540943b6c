//! opsync binary entry point.

use anyhow::Result;
use clap::Parser;
use opsync::{Cli, Commands};
use opsync_shared::ObservabilitySystem;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        ObservabilitySystem::init(&config.observability)?;

        match cli.command {
            Commands::Consume => opsync::run_consume(&config).await,
            Commands::Report(args) => {
                let summary = opsync::run_report(&args, &config).await?;
                println!(
                    "Exported {} records to {}",
                    summary.records,
                    summary.output.display()
                );
                Ok(())
            }
        }
    })
}
