//! # Benchmark Engine Module
//!
//! Orchestrates one complete run: account provisioning, pairing, the ping
//! phase and result collection.
//!
//! ## Run Lifecycle
//!
//! 1. **Validation**: window and pair count are checked before anything is
//!    provisioned or sent
//! 2. **Setup**: a temporary accounts directory is created and the backend is
//!    started inside it
//! 3. **Provisioning**: `2 × pairs` accounts are configured concurrently and
//!    linked into pairs
//! 4. **Ping phase**: one pinger and one ponger task per pair; result lines
//!    are streamed as they arrive
//! 5. **Cleanup**: the backend is dropped, then the accounts directory
//!
//! The first failing task aborts the run. A stalled pair holds up the end of
//! the run but never the progress or output of the other pairs.

use crate::{
    backend::{BackendConfig, BackendFactory, BackendKind, MessagingBackend},
    cli::Args,
    credentials::CredentialSource,
    elapsed::Elapsed,
    error::BenchError,
    logging::LogLevel,
    pingpong::{Pinger, Ponger, ProbeWindow, ResultRecord},
    provision::{pair_accounts, wait_for_all, Pair, Provisioner},
    results::{BenchmarkResults, ResultsManager, TestConfiguration},
    utils::{generate_run_id, validate_pairs, validate_percentiles},
};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Single source of truth for displaying the run configuration.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
}

impl<'a> std::fmt::Display for BenchmarkConfigDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark on: {} backend", config.backend.kind)?;
        writeln!(f, "  Pairs:              {}", config.pairs)?;
        writeln!(f, "  Pings per Pair:     {}", config.num_pings)?;
        writeln!(f, "  Window:             {}", config.window)?;
        match config.backend.kind {
            BackendKind::Rpc => {
                writeln!(f, "  RPC Server:         {}", config.backend.rpc_server)?;
            }
            BackendKind::Loopback => {
                writeln!(
                    f,
                    "  Delivery Latency:   {:?} (+ up to {:?} jitter)",
                    config.backend.loopback_latency, config.backend.loopback_jitter
                )?;
            }
        }
        let source = match (&config.tmp_email_url, &config.chatmail_domain) {
            (Some(url), _) => format!("temporary account URL {}", url),
            (None, Some(domain)) => format!("chatmail domain {}", domain),
            (None, None) => "default".to_string(),
        };
        writeln!(f, "  Accounts From:      {}", source)?;
        writeln!(f, "  Log Level:          {}", config.log_level)?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for one benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Number of ping/pong pairs
    pub pairs: usize,

    /// Probes sent by each pinger
    pub num_pings: u64,

    /// Maximum probes in flight per pair
    pub window: usize,

    pub backend: BackendConfig,
    pub chatmail_domain: Option<String>,
    pub tmp_email_url: Option<String>,

    /// Threshold for backend diagnostic events
    pub log_level: LogLevel,

    pub percentiles: Vec<f64>,

    /// JSON summary destination
    pub output_file: Option<PathBuf>,

    /// Per-record CSV stream destination
    pub streaming_output_csv: Option<PathBuf>,
}

impl BenchmarkConfig {
    /// Create benchmark configuration from CLI arguments
    ///
    /// Fails on a zero or oversized window, an out-of-range pair count or an
    /// invalid percentile.
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            pairs: args.proc,
            num_pings: args.num_pings,
            window: args.window,
            backend: BackendConfig {
                kind: args.backend,
                rpc_server: args.rpc_server.clone(),
                loopback_latency: args.loopback_latency,
                loopback_jitter: args.loopback_jitter,
            },
            chatmail_domain: args.chatmail_domain.clone(),
            tmp_email_url: args.tmp_email_url.clone(),
            log_level: args.log_level,
            percentiles: args.percentiles.clone(),
            output_file: args.output_file.clone(),
            streaming_output_csv: args.streaming_output_csv.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every precondition that can be checked without a backend.
    pub fn validate(&self) -> Result<()> {
        validate_pairs(self.pairs)?;
        ProbeWindow::new(self.window, self.num_pings)?;
        validate_percentiles(&self.percentiles)?;
        Ok(())
    }

    /// Where account credentials come from.
    ///
    /// The loopback backend accepts any address, so it falls back to a
    /// reserved domain when nothing is configured.
    pub fn credential_source(&self) -> Result<CredentialSource> {
        match CredentialSource::from_options(
            self.chatmail_domain.as_deref(),
            self.tmp_email_url.as_deref(),
        ) {
            Err(e)
                if self.backend.kind == BackendKind::Loopback
                    && matches!(
                        e.downcast_ref::<BenchError>(),
                        Some(BenchError::MissingCredentialSource)
                    ) =>
            {
                Ok(CredentialSource::ChatmailDomain(
                    crate::defaults::LOOPBACK_DOMAIN.to_string(),
                ))
            }
            other => other,
        }
    }

    pub fn test_configuration(&self) -> TestConfiguration {
        TestConfiguration {
            pairs: self.pairs,
            num_pings: self.num_pings,
            window: self.window,
            backend: self.backend.kind,
            log_level: self.log_level,
            percentiles: self.percentiles.clone(),
        }
    }
}

/// Benchmark runner that coordinates one run end to end
///
/// ```rust,no_run
/// # use chat_pingpong::{Args, BenchmarkConfig, BenchmarkRunner};
/// # use chat_pingpong::backend::BackendKind;
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let args = Args {
///     backend: BackendKind::Loopback,
///     num_pings: 10,
///     window: 2,
///     ..Default::default()
/// };
/// let config = BenchmarkConfig::from_args(&args)?;
/// let results = BenchmarkRunner::new(config).run().await?;
/// println!("{} round trips", results.total_records());
/// # Ok(())
/// # }
/// ```
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    backend: Option<Arc<dyn MessagingBackend>>,
    output: Option<Box<dyn Write + Send>>,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self {
            config,
            backend: None,
            output: None,
        }
    }

    /// Run against an existing backend instead of building one from the
    /// configuration.
    pub fn with_backend(mut self, backend: Arc<dyn MessagingBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Write result lines to `output` instead of stdout.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Some(output);
        self
    }

    /// Run the benchmark and return its results
    ///
    /// Result lines are written while the run is in progress; the returned
    /// [`BenchmarkResults`] carries the same records plus the summaries.
    pub async fn run(self) -> Result<BenchmarkResults> {
        let config = self.config;
        config.validate()?;
        info!("{}", BenchmarkConfigDisplay { config: &config });

        let run_id = generate_run_id();
        // Declared before the backend so it is removed only after the
        // backend has shut down.
        let temp_dir = tempfile::Builder::new()
            .prefix(&temp_dir_prefix(&run_id))
            .tempdir()
            .context("Failed to create temporary directory")?;
        let accounts_dir = temp_dir.path().join("accounts");
        std::fs::create_dir_all(&accounts_dir).with_context(|| {
            format!("Failed to create accounts dir {}", accounts_dir.display())
        })?;
        debug!("Run {} uses accounts dir {}", run_id, accounts_dir.display());

        let backend = match self.backend {
            Some(backend) => backend,
            None => BackendFactory::create(&config.backend, &accounts_dir)?,
        };

        let setup = Elapsed::start();
        let provisioner = Provisioner::new(Arc::clone(&backend), config.credential_source()?);
        let accounts = provisioner.provision(config.pairs * 2).await?;
        let pairs = pair_accounts(&accounts, config.pairs).await?;
        let provisioning_secs = setup.seconds();
        info!("Setup of {} pairs took {}s", pairs.len(), setup);

        let mut manager = match self.output {
            Some(output) => ResultsManager::with_output(output, config.percentiles.clone())?,
            None => ResultsManager::new(config.percentiles.clone())?,
        };
        if let Some(ref path) = config.streaming_output_csv {
            manager.enable_streaming_csv(path)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(manager.collect(rx));
        let tasks = spawn_pairs(&pairs, config.num_pings, config.window, config.log_level, tx)?;
        wait_for_all(tasks, "ping-pong").await?;

        let manager = collector.await.context("results task panicked")??;
        let results = manager.finalize(run_id, config.test_configuration(), provisioning_secs)?;
        if let Some(ref path) = config.output_file {
            results.write_json(path)?;
        }

        info!("Benchmark completed on {} backend", backend.name());
        Ok(results)
    }
}

/// Prefix of the temporary accounts directory of run `run_id`.
fn temp_dir_prefix(run_id: &str) -> String {
    format!("chat-pingpong-{}-", run_id)
}

/// Spawn a pinger and a ponger task for every pair.
///
/// All pingers are validated before the first task starts, so a bad window
/// fails before any probe is sent. Records go to `results`; the channel
/// closes once every pinger has finished.
pub fn spawn_pairs(
    pairs: &[Pair],
    num_pings: u64,
    window: usize,
    log_level: LogLevel,
    results: mpsc::UnboundedSender<ResultRecord>,
) -> Result<JoinSet<Result<()>>> {
    let pingers = pairs
        .iter()
        .map(|pair| {
            Pinger::new(
                pair.index,
                Arc::clone(&pair.pinger),
                pair.chat,
                window,
                num_pings,
                log_level,
            )
        })
        .collect::<Result<Vec<_>, BenchError>>()?;

    let mut tasks = JoinSet::new();
    for (pair, pinger) in pairs.iter().zip(pingers) {
        let ponger = Ponger::new(pair.index, Arc::clone(&pair.ponger), num_pings, log_level);
        tasks.spawn(ponger.run());
        tasks.spawn(pinger.run(results.clone()));
    }
    Ok(tasks)
}
