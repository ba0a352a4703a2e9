//! # Chat Ping/Pong Benchmark Library
//!
//! Measures message round-trip latency of a chat messaging backend. Pairs of
//! temporary accounts are provisioned; in each pair one account sends
//! numbered probes and the other echoes them back, and every round trip is
//! reported as a `<seq>,<elapsed-seconds>` line.
//!
//! ## Architecture Overview
//!
//! - `backend`: capability traits over the messaging backend, plus the
//!   JSON-RPC and in-process loopback implementations
//! - `credentials`: temporary account addresses and passwords
//! - `provision`: concurrent account setup, pairing and wait-for-all
//! - `pingpong`: the windowed pinger and the echoing ponger
//! - `benchmark`: run orchestration from configuration to results
//! - `metrics` / `results`: HDR histogram statistics and output handling
//! - `cli`, `logging`, `error`, `elapsed`, `utils`: ambient support
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use chat_pingpong::{Args, BenchmarkConfig, BenchmarkRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args {
//!         proc: 2,
//!         num_pings: 50,
//!         window: 4,
//!         chatmail_domain: Some("nine.testrun.org".to_string()),
//!         ..Default::default()
//!     };
//!     let config = BenchmarkConfig::from_args(&args)?;
//!     let results = BenchmarkRunner::new(config).run().await?;
//!
//!     if let Some(latency) = results.overall {
//!         println!("Mean round trip: {:.0}ns", latency.mean_ns);
//!     }
//!     Ok(())
//! }
//! ```

/// Messaging backend abstraction and implementations
///
/// The `Account` and `MessagingBackend` traits are the only way the
/// benchmark touches a chat server.
pub mod backend;

/// Run orchestration
///
/// `BenchmarkConfig` validates the run parameters; `BenchmarkRunner`
/// provisions, pairs, runs the ping phase and collects the results.
pub mod benchmark;

/// Command-line interface
pub mod cli;

pub mod credentials;
pub mod elapsed;
pub mod error;

/// Subscriber setup and the explicit diagnostic threshold
pub mod logging;

/// Latency and throughput measurement using HDR histograms
pub mod metrics;

pub mod pingpong;
pub mod provision;

/// Result streaming, aggregation and JSON output
pub mod results;

pub mod utils;

pub use backend::{Account, BackendKind, Event, MessagingBackend};
pub use benchmark::{BenchmarkConfig, BenchmarkRunner};
pub use cli::Args;
pub use error::BenchError;
pub use logging::LogLevel;
pub use metrics::{LatencyMetrics, ThroughputMetrics};
pub use pingpong::{Pinger, Ponger, ResultRecord};
pub use results::{BenchmarkResults, ResultsManager};

/// Version reported in the JSON summary
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Number of ping/pong pairs
    pub const PROC: usize = 1;

    /// Probes per pair
    pub const NUM_PINGS: u64 = 100;

    /// One probe in flight at a time measures plain round-trip latency.
    pub const WINDOW: usize = 1;

    /// RPC server binary, looked up on `PATH`
    pub const RPC_SERVER: &str = "deltachat-rpc-server";

    /// One-way delivery delay of the loopback backend
    pub const LOOPBACK_LATENCY: Duration = Duration::from_millis(5);

    /// Address domain used by the loopback backend when none is configured.
    ///
    /// `.invalid` is reserved, so these addresses can never reach a real
    /// server.
    pub const LOOPBACK_DOMAIN: &str = "loopback.invalid";

    pub const PERCENTILES: &[f64] = &[50.0, 95.0, 99.0, 99.9];
}
