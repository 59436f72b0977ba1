//! Tally CLI
//!
//! Runs an aggregate processor over newline-delimited JSON events.

mod config;
mod error;
mod pipeline;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tally_aggregate::AggregateProcessor;
use tally_core::{ComparisonEvaluator, ExpressionEvaluator};
use tokio::io::BufReader;
use tracing::info;

use crate::config::TallyConfig;
use crate::pipeline::Pipeline;

/// Tally: aggregate telemetry events by group.
#[derive(Parser, Debug)]
#[command(name = "tally", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tally.toml")]
    config: PathBuf,

    /// Read events from this file instead of stdin.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Override the configured batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration file and exit.
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init();

    let mut config = TallyConfig::load(&cli.config)?;
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
        config.validate()?;
    }

    let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(ComparisonEvaluator::new());
    let processor = AggregateProcessor::new(config.processor, Some(evaluator))?;

    if let Some(Commands::Validate) = cli.command {
        info!(path = %cli.config.display(), "configuration is valid");
        return Ok(());
    }

    let pipeline = Pipeline::new(
        Arc::new(processor),
        config.batch_size,
        config.scheduler.conclude_interval(),
    );
    let stdout = tokio::io::stdout();
    let summary = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            pipeline.run(BufReader::new(file), stdout).await?
        }
        None => pipeline.run(BufReader::new(tokio::io::stdin()), stdout).await?,
    };

    info!(
        events_written = summary.events_written,
        malformed_lines = summary.malformed_lines,
        "tally finished"
    );
    Ok(())
}
