use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Round-trip latency statistics including percentiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: usize,
}

/// Percentile value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Completed round trips per second
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub round_trips_per_second: f64,
    pub total_round_trips: usize,
    pub duration_ns: u64,
}

/// Latency collector using HDR histogram for accurate measurement
pub struct LatencyCollector {
    histogram: Histogram<u64>,
    sample_count: usize,
}

impl LatencyCollector {
    /// Create a new latency collector
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;

        Ok(Self {
            histogram,
            sample_count: 0,
        })
    }

    /// Record a latency measurement
    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let latency_ns = latency.as_nanos() as u64;
        self.histogram.record(latency_ns)?;
        self.sample_count += 1;
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Get the current metrics
    pub fn get_metrics(&self, percentiles: &[f64]) -> LatencyMetrics {
        let percentile_values = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect();

        LatencyMetrics {
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            median_ns: self.histogram.value_at_percentile(50.0) as f64,
            std_dev_ns: self.histogram.stdev(),
            percentiles: percentile_values,
            total_samples: self.sample_count,
        }
    }
}

/// Throughput calculator for completed round trips
pub struct ThroughputCalculator {
    start_time: Instant,
    round_trips: usize,
}

impl Default for ThroughputCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputCalculator {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            round_trips: 0,
        }
    }

    pub fn record_round_trip(&mut self) {
        self.round_trips += 1;
    }

    pub fn get_metrics(&self) -> ThroughputMetrics {
        let elapsed = self.start_time.elapsed();
        let duration_secs = elapsed.as_secs_f64();

        let round_trips_per_second = if duration_secs > 0.0 {
            self.round_trips as f64 / duration_secs
        } else {
            0.0
        };

        ThroughputMetrics {
            round_trips_per_second,
            total_round_trips: self.round_trips,
            duration_ns: elapsed.as_nanos() as u64,
        }
    }
}

/// Format latency in human-readable units
pub fn format_latency(latency_ns: u64) -> String {
    crate::utils::format_duration(Duration::from_nanos(latency_ns))
}
