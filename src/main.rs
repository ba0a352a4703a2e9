//! # Chat Ping/Pong Benchmark - Main Entry Point
//!
//! 1. **Parse arguments**: command-line and environment configuration
//! 2. **Initialize logging**: stderr console output plus an optional file
//! 3. **Create benchmark config**: validates window, pairs and percentiles
//! 4. **Run**: provisioning, pairing and the ping phase; result lines are
//!    printed to stdout as they arrive
//!
//! Any error ends the run with a non-zero exit status and the diagnostic on
//! stderr.

use anyhow::Result;
use chat_pingpong::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::Args,
    logging::{init_logging, LoggingConfig},
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so the file writer gets flushed.
    let _log_guard = init_logging(&LoggingConfig {
        level: args.log_level,
        log_file: args.log_file.clone(),
    })?;

    info!("Starting chat ping/pong benchmark v{}", chat_pingpong::VERSION);
    info!("Configuration: {:?}", args);

    let config = BenchmarkConfig::from_args(&args)?;
    let results = BenchmarkRunner::new(config).run().await?;

    info!(
        "Benchmark finished: {} round trips",
        results.total_records()
    );
    Ok(())
}
