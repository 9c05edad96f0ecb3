//! Paddock Ingest - run pipeline stages from the command line

use clap::{Parser, Subcommand};
use paddock_common::logging::{init_logging, LogConfig, LogLevel};
use paddock_common::types::ArtifactName;
use paddock_ingest::config::PipelineConfig;
use paddock_ingest::context::PipelineContext;
use paddock_ingest::jobs::{JobRunner, StageJob};
use paddock_ingest::orchestrator::RunParams;
use paddock_ingest::PipelineError;
use serde::Serialize;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "paddock-ingest")]
#[command(author, version, about = "Paddock horse data pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one id range into a shard artifact
    Fetch {
        start_id: i64,
        batch_size: i64,
    },

    /// Merge every pending shard into a master artifact
    Merge,

    /// Clean and dedupe an artifact
    Clean {
        /// Object key of the artifact to clean
        artifact: String,
    },

    /// Load a cleaned artifact into the warehouse
    Upsert {
        bucket: String,
        /// Object key of the cleaned artifact
        artifact: String,
    },

    /// Run the whole pipeline
    Run {
        #[arg(long)]
        start_id: i64,

        #[arg(long)]
        batch_size: i64,

        #[arg(long, default_value_t = 1)]
        max_batches: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("paddock-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        // Not-found conditions are actionable (fetch first), report them apart
        process::exit(if e.is_not_found() { 2 } else { 1 });
    }
}

async fn execute(command: Command) -> Result<(), PipelineError> {
    let config = PipelineConfig::from_env()?;
    let context = PipelineContext::connect(config).await?;

    let job = match command {
        Command::Run {
            start_id,
            batch_size,
            max_batches,
        } => {
            let params = RunParams::new(start_id, batch_size, max_batches)?;
            let summary = context.orchestrator().run_pipeline(params).await?;
            return print_json(&summary);
        }
        Command::Fetch {
            start_id,
            batch_size,
        } => {
            let params = RunParams::single(start_id, batch_size)?;
            StageJob::Fetch {
                start_id: params.start_id,
                batch_size: params.batch_size,
            }
        }
        Command::Merge => StageJob::Merge,
        Command::Clean { artifact } => StageJob::Clean {
            artifact: parse_key(&artifact)?,
        },
        Command::Upsert { bucket, artifact } => StageJob::Upsert {
            bucket,
            artifact: parse_key(&artifact)?,
        },
    };

    let operation = context.runner().submit(job).await?;
    info!(operation = %operation.name(), "Submitted");
    let output = operation.wait().await?;
    print_json(&output)
}

fn parse_key(key: &str) -> Result<String, PipelineError> {
    ArtifactName::parse(key)
        .map(|name| name.as_str().to_string())
        .map_err(|e| PipelineError::Validation(e.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::Config(format!("Failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}
