//! Stopwatch used for probe round trips and for provisioning time.

use std::fmt;
use std::time::{Duration, Instant};

/// Captures a start instant on construction and reports time since then.
#[derive(Debug, Clone, Copy)]
pub struct Elapsed {
    start: Instant,
}

impl Elapsed {
    /// Start a new stopwatch now.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time since start in fractional seconds.
    pub fn seconds(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

impl Default for Elapsed {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.seconds())
    }
}
