//! # Utility Functions
//!
//! Formatting and validation helpers shared by the runner and the results
//! manager.
//!
//! ```rust
//! use chat_pingpong::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! validate_pairs(2)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Result};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for one benchmark run.
///
/// Part of the temporary accounts directory name and of the JSON summary.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ```rust
/// # use chat_pingpong::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Validate the number of ping/pong pairs.
///
/// Each pair costs two live accounts on the backend, so the upper bound
/// keeps an accidental extra digit from provisioning thousands of them.
pub fn validate_pairs(pairs: usize) -> Result<()> {
    if pairs == 0 {
        bail!("Number of pairs must be at least 1");
    }
    if pairs > 512 {
        bail!("Number of pairs is too large (max 512)");
    }
    Ok(())
}

/// Validate requested percentiles lie in `[0, 100]`.
pub fn validate_percentiles(percentiles: &[f64]) -> Result<()> {
    for &p in percentiles {
        if !(0.0..=100.0).contains(&p) {
            bail!("Percentile {} is outside 0..=100", p);
        }
    }
    Ok(())
}

/// Number of logical CPU cores, for the system info block of the summary.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}
