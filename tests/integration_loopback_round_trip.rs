use anyhow::Result;
use chat_pingpong::backend::{BackendKind, LoopbackBackend};
use chat_pingpong::{cli::Args, BenchmarkConfig, BenchmarkRunner};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collects what the runner prints as result lines.
#[derive(Clone, Default)]
struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedOutput {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// One pair, five probes, two in flight: every probe is reported exactly once.
#[tokio::test]
async fn loopback_single_pair_end_to_end() -> Result<()> {
    let args = Args {
        backend: BackendKind::Loopback,
        proc: 1,
        num_pings: 5,
        window: 2,
        ..Default::default()
    };
    let output = CapturedOutput::default();

    let config = BenchmarkConfig::from_args(&args)?;
    let results = BenchmarkRunner::new(config)
        .with_output(Box::new(output.clone()))
        .run()
        .await?;

    let lines = output.lines();
    assert_eq!(lines.len(), 5);
    let mut seqs = Vec::new();
    for line in &lines {
        let (seq, elapsed) = line.split_once(',').expect("seq,elapsed line");
        seqs.push(seq.parse::<u64>()?);
        assert!(elapsed.parse::<f64>()? >= 0.0);
    }
    seqs.sort();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    assert_eq!(results.total_records(), 5);
    assert_eq!(results.overall.as_ref().map(|m| m.total_samples), Some(5));
    Ok(())
}

/// With jitter echoes overtake each other; each pair still reports each
/// sequence number exactly once.
#[tokio::test]
async fn loopback_jitter_conserves_probes() -> Result<()> {
    let args = Args {
        backend: BackendKind::Loopback,
        proc: 3,
        num_pings: 12,
        window: 4,
        ..Default::default()
    };
    let backend = Arc::new(LoopbackBackend::new(
        Duration::from_millis(1),
        Duration::from_millis(8),
    ));

    let config = BenchmarkConfig::from_args(&args)?;
    let results = BenchmarkRunner::new(config)
        .with_backend(backend)
        .with_output(Box::new(std::io::sink()))
        .run()
        .await?;

    assert_eq!(results.total_records(), 36);
    for pair in 0..3 {
        let mut seqs: Vec<u64> = results
            .records
            .iter()
            .filter(|r| r.pair == pair)
            .map(|r| r.seq)
            .collect();
        seqs.sort();
        assert_eq!(seqs, (0..12).collect::<Vec<_>>(), "pair {}", pair);
    }
    assert_eq!(results.pairs.len(), 3);
    Ok(())
}

/// The JSON summary and the CSV stream are written when requested.
#[tokio::test]
async fn loopback_writes_summary_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let json_path = dir.path().join("summary.json");
    let csv_path = dir.path().join("stream.csv");
    let args = Args {
        backend: BackendKind::Loopback,
        num_pings: 3,
        output_file: Some(json_path.clone()),
        streaming_output_csv: Some(csv_path.clone()),
        ..Default::default()
    };

    let config = BenchmarkConfig::from_args(&args)?;
    BenchmarkRunner::new(config)
        .with_output(Box::new(std::io::sink()))
        .run()
        .await?;

    let summary: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json_path)?)?;
    assert_eq!(summary["test_config"]["num_pings"], 3);
    assert_eq!(summary["overall"]["total_samples"], 3);

    let csv = std::fs::read_to_string(&csv_path)?;
    let mut rows = csv.lines();
    assert_eq!(rows.next(), Some("pair,seq,elapsed_s"));
    assert_eq!(rows.count(), 3);
    Ok(())
}
