mod cli;
mod config;
mod progress;
mod run;

use anyhow::Result;
use clap::Parser;
use engine_logging::{engine_info, LogDestination};
use log::LevelFilter;

use crate::cli::Cli;
use crate::config::RunConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let destination = match cli.log_file.as_deref() {
        Some(path) => LogDestination::TerminalAndFile(path),
        None => LogDestination::Terminal,
    };
    engine_logging::initialize(destination, level);

    let config = RunConfig::load(&cli)?;
    let summary = run::run(config).await?;
    engine_info!(
        "{} of {} urls harvested, {} failed",
        summary.succeeded,
        summary.total,
        summary.failed
    );
    Ok(())
}
