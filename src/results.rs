use crate::{
    backend::BackendKind,
    logging::LogLevel,
    metrics::{format_latency, LatencyCollector, LatencyMetrics, ThroughputCalculator, ThroughputMetrics},
    pingpong::ResultRecord,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Complete results of one benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResults {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub test_config: TestConfiguration,
    pub provisioning_secs: f64,
    pub overall: Option<LatencyMetrics>,
    pub pairs: Vec<PairSummary>,
    pub throughput: ThroughputMetrics,
    pub system_info: SystemInfo,
    /// Every record in arrival order.
    #[serde(skip)]
    pub records: Vec<ResultRecord>,
}

/// Test configuration used for the benchmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub pairs: usize,
    pub num_pings: u64,
    pub window: usize,
    pub backend: BackendKind,
    pub log_level: LogLevel,
    pub percentiles: Vec<f64>,
}

/// Latency summary of one pair
#[derive(Debug, Clone, Serialize)]
pub struct PairSummary {
    pub pair: usize,
    pub latency: LatencyMetrics,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

impl BenchmarkResults {
    /// Total number of answered probes.
    pub fn total_records(&self) -> usize {
        self.records.len()
    }

    /// Write the JSON summary to `path`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        info!("Results written to {}", path.display());
        Ok(())
    }
}

/// Streams result lines as they arrive and aggregates them
///
/// Each record is written to the primary output (stdout by default) and
/// flushed immediately; nothing is buffered until the end of the run.
pub struct ResultsManager {
    output: Box<dyn Write + Send>,
    streaming_file: Option<File>,
    percentiles: Vec<f64>,
    records: Vec<ResultRecord>,
    overall: LatencyCollector,
    per_pair: BTreeMap<usize, LatencyCollector>,
    throughput: ThroughputCalculator,
}

impl ResultsManager {
    /// Create a results manager writing to stdout
    pub fn new(percentiles: Vec<f64>) -> Result<Self> {
        Self::with_output(Box::new(std::io::stdout()), percentiles)
    }

    /// Create a results manager writing result lines to `output`
    pub fn with_output(output: Box<dyn Write + Send>, percentiles: Vec<f64>) -> Result<Self> {
        Ok(Self {
            output,
            streaming_file: None,
            percentiles,
            records: Vec::new(),
            overall: LatencyCollector::new()?,
            per_pair: BTreeMap::new(),
            throughput: ThroughputCalculator::new(),
        })
    }

    /// Additionally stream `pair,seq,elapsed_s` rows to a CSV file
    pub fn enable_streaming_csv<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(file, "pair,seq,elapsed_s")?;
        self.streaming_file = Some(file);
        debug!("Enabled CSV streaming to: {}", path.display());
        Ok(())
    }

    /// Emit one record and fold it into the statistics
    pub fn record(&mut self, record: ResultRecord) -> Result<()> {
        writeln!(self.output, "{}", record)?;
        self.output.flush()?;

        if let Some(file) = self.streaming_file.as_mut() {
            writeln!(file, "{},{},{}", record.pair, record.seq, record.elapsed_secs())?;
        }

        self.overall.record(record.elapsed)?;
        match self.per_pair.get_mut(&record.pair) {
            Some(collector) => collector.record(record.elapsed)?,
            None => {
                let mut collector = LatencyCollector::new()?;
                collector.record(record.elapsed)?;
                self.per_pair.insert(record.pair, collector);
            }
        }
        self.throughput.record_round_trip();
        self.records.push(record);
        Ok(())
    }

    /// Drain `rx` until every sender is gone
    pub async fn collect(mut self, mut rx: mpsc::UnboundedReceiver<ResultRecord>) -> Result<Self> {
        while let Some(record) = rx.recv().await {
            self.record(record)?;
        }
        Ok(self)
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// Build the final results and log a summary
    pub fn finalize(
        mut self,
        run_id: String,
        test_config: TestConfiguration,
        provisioning_secs: f64,
    ) -> Result<BenchmarkResults> {
        if let Some(file) = self.streaming_file.as_mut() {
            file.flush()?;
        }

        let overall = (self.overall.sample_count() > 0)
            .then(|| self.overall.get_metrics(&self.percentiles));
        let pairs: Vec<PairSummary> = self
            .per_pair
            .iter()
            .map(|(&pair, collector)| PairSummary {
                pair,
                latency: collector.get_metrics(&self.percentiles),
            })
            .collect();
        let throughput = self.throughput.get_metrics();

        if let Some(ref latency) = overall {
            info!(
                "{} round trips: min {}, mean {}, max {}, {:.2} round trips/s",
                latency.total_samples,
                format_latency(latency.min_ns),
                format_latency(latency.mean_ns as u64),
                format_latency(latency.max_ns),
                throughput.round_trips_per_second
            );
            for p in &latency.percentiles {
                info!("  P{}: {}", p.percentile, format_latency(p.value_ns));
            }
        }

        Ok(BenchmarkResults {
            run_id,
            timestamp: chrono::Utc::now(),
            test_config,
            provisioning_secs,
            overall,
            pairs,
            throughput,
            system_info: SystemInfo::default(),
            records: self.records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Writer that keeps what was written for inspection.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn test_config() -> TestConfiguration {
        TestConfiguration {
            pairs: 2,
            num_pings: 2,
            window: 1,
            backend: BackendKind::Loopback,
            log_level: LogLevel::Error,
            percentiles: vec![50.0, 99.0],
        }
    }

    fn record(pair: usize, seq: u64, ms: u64) -> ResultRecord {
        ResultRecord {
            pair,
            seq,
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_records_are_written_immediately() {
        let buffer = SharedBuffer::default();
        let mut manager =
            ResultsManager::with_output(Box::new(buffer.clone()), vec![50.0]).unwrap();

        manager.record(record(0, 0, 500)).unwrap();
        assert_eq!(buffer.contents(), "0,0.5\n");
        manager.record(record(0, 1, 250)).unwrap();
        assert_eq!(buffer.contents(), "0,0.5\n1,0.25\n");
    }

    #[test]
    fn test_finalize_summarizes_per_pair() {
        let buffer = SharedBuffer::default();
        let mut manager =
            ResultsManager::with_output(Box::new(buffer), vec![50.0, 99.0]).unwrap();
        manager.record(record(0, 0, 10)).unwrap();
        manager.record(record(1, 0, 20)).unwrap();
        manager.record(record(0, 1, 30)).unwrap();
        manager.record(record(1, 1, 40)).unwrap();

        let results = manager.finalize("run".into(), test_config(), 1.5).unwrap();
        assert_eq!(results.total_records(), 4);
        assert_eq!(results.pairs.len(), 2);
        assert_eq!(results.pairs[0].latency.total_samples, 2);
        assert_eq!(results.pairs[1].latency.total_samples, 2);
        let overall = results.overall.unwrap();
        assert_eq!(overall.total_samples, 4);
        assert_eq!(overall.percentiles.len(), 2);
    }

    #[test]
    fn test_finalize_without_records() {
        let manager =
            ResultsManager::with_output(Box::new(SharedBuffer::default()), vec![50.0]).unwrap();
        let results = manager.finalize("run".into(), test_config(), 0.0).unwrap();
        assert!(results.overall.is_none());
        assert!(results.pairs.is_empty());
    }

    #[test]
    fn test_streaming_csv_and_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("stream.csv");
        let json_path = dir.path().join("results.json");

        let mut manager =
            ResultsManager::with_output(Box::new(SharedBuffer::default()), vec![50.0]).unwrap();
        manager.enable_streaming_csv(&csv_path).unwrap();
        manager.record(record(1, 4, 125)).unwrap();
        let results = manager.finalize("run-1".into(), test_config(), 0.2).unwrap();
        results.write_json(&json_path).unwrap();

        let csv = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(csv, "pair,seq,elapsed_s\n1,4,0.125\n");

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["test_config"]["window"], 1);
        assert_eq!(json["overall"]["total_samples"], 1);
    }

    #[tokio::test]
    async fn test_collect_drains_channel() {
        let buffer = SharedBuffer::default();
        let manager =
            ResultsManager::with_output(Box::new(buffer.clone()), vec![50.0]).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(record(0, 0, 1)).unwrap();
        tx.send(record(0, 1, 2)).unwrap();
        drop(tx);

        let manager = manager.collect(rx).await.unwrap();
        assert_eq!(manager.records().len(), 2);
        assert_eq!(buffer.contents().lines().count(), 2);
    }
}
