use crate::backend::BackendKind;
use crate::logging::LogLevel;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Chat ping/pong latency benchmark
///
/// Provisions pairs of temporary chat accounts and measures the round-trip
/// time of numbered text messages between them. Each answered probe prints
/// one `<seq>,<elapsed-seconds>` line on stdout.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of concurrent ping/pong pairs
    #[clap(short = 'p', long = "proc", default_value_t = crate::defaults::PROC, help_heading = "Core Options")]
    pub proc: usize,

    /// Number of probes each pinger sends
    #[clap(short = 'n', long, alias = "limit", default_value_t = crate::defaults::NUM_PINGS, help_heading = "Core Options")]
    pub num_pings: u64,

    /// Maximum probes in flight per pair (must not exceed --num-pings)
    #[clap(short = 'w', long, default_value_t = crate::defaults::WINDOW, help_heading = "Core Options")]
    pub window: usize,

    /// Messaging backend
    #[clap(long, value_enum, default_value_t = BackendKind::Rpc, help_heading = "Backend")]
    pub backend: BackendKind,

    /// Path of the deltachat-rpc-server binary
    #[clap(long, env = "DELTACHAT_RPC_SERVER", default_value = crate::defaults::RPC_SERVER, help_heading = "Backend")]
    pub rpc_server: String,

    /// Chatmail domain to generate account addresses on
    #[clap(long, env = "CHATMAIL_DOMAIN", help_heading = "Backend")]
    pub chatmail_domain: Option<String>,

    /// URL handing out temporary accounts (takes precedence over --chatmail-domain)
    #[clap(long, env = "DCC_NEW_TMP_EMAIL", help_heading = "Backend")]
    pub tmp_email_url: Option<String>,

    /// One-way delivery delay of the loopback backend (e.g. "5ms")
    #[clap(long, value_parser = parse_duration, default_value = "5ms", help_heading = "Backend")]
    pub loopback_latency: Duration,

    /// Random extra delay of up to this much per loopback delivery
    #[clap(long, value_parser = parse_duration, default_value = "0ms", help_heading = "Backend")]
    pub loopback_jitter: Duration,

    /// Lowest severity of diagnostics to show (RUST_LOG overrides)
    #[clap(long, value_enum, default_value_t = LogLevel::Error, help_heading = "Output")]
    pub log_level: LogLevel,

    /// Also write diagnostics to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Percentiles to report in the summary
    #[clap(long, num_args = 1.., default_values_t = crate::defaults::PERCENTILES.to_vec(), help_heading = "Output")]
    pub percentiles: Vec<f64>,

    /// Write a JSON summary of the run to this file
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Stream `pair,seq,elapsed_s` rows to this CSV file while running
    #[clap(long, help_heading = "Output")]
    pub streaming_output_csv: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            proc: crate::defaults::PROC,
            num_pings: crate::defaults::NUM_PINGS,
            window: crate::defaults::WINDOW,
            backend: BackendKind::Rpc,
            rpc_server: crate::defaults::RPC_SERVER.to_string(),
            chatmail_domain: None,
            tmp_email_url: None,
            loopback_latency: crate::defaults::LOOPBACK_LATENCY,
            loopback_jitter: Duration::ZERO,
            log_level: LogLevel::default(),
            log_file: None,
            percentiles: crate::defaults::PERCENTILES.to_vec(),
            output_file: None,
            streaming_output_csv: None,
        }
    }
}

/// Parse duration from string (e.g., "5ms", "1.5s", "2m")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else {
        (s, "ms") // Bare numbers are milliseconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "us" => num / 1_000_000.0,
        "ms" => num / 1_000.0,
        "s" => num,
        "m" => num * 60.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500us").unwrap(), Duration::from_micros(500));
        assert_eq!(parse_duration("5ms").unwrap(), Duration::from_millis(5));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("20").unwrap(), Duration::from_millis(20));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5ms").is_err());
    }

    #[test]
    fn test_defaults_match_parsed_defaults() {
        let parsed = Args::try_parse_from(["chat-pingpong"]).unwrap();
        let default = Args::default();
        assert_eq!(parsed.proc, default.proc);
        assert_eq!(parsed.num_pings, default.num_pings);
        assert_eq!(parsed.window, default.window);
        assert_eq!(parsed.backend, BackendKind::Rpc);
        assert_eq!(parsed.log_level, LogLevel::Error);
        assert_eq!(parsed.loopback_latency, default.loopback_latency);
        assert_eq!(parsed.percentiles, default.percentiles);
    }

    #[test]
    fn test_core_options() {
        let args = Args::try_parse_from([
            "chat-pingpong",
            "-p",
            "4",
            "--limit",
            "20",
            "-w",
            "3",
            "--backend",
            "loopback",
            "--log-level",
            "warn",
            "--loopback-jitter",
            "2ms",
        ])
        .unwrap();
        assert_eq!(args.proc, 4);
        assert_eq!(args.num_pings, 20);
        assert_eq!(args.window, 3);
        assert_eq!(args.backend, BackendKind::Loopback);
        assert_eq!(args.log_level, LogLevel::Warning);
        assert_eq!(args.loopback_jitter, Duration::from_millis(2));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Args::try_parse_from(["chat-pingpong", "--backend", "smtp"]).is_err());
    }
}
