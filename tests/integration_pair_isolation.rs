use anyhow::Result;
use chat_pingpong::backend::{LoopbackBackend, MessagingBackend};
use chat_pingpong::benchmark::spawn_pairs;
use chat_pingpong::credentials::CredentialSource;
use chat_pingpong::logging::LogLevel;
use chat_pingpong::provision::{pair_accounts, wait_for_all, Provisioner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Two pairs, one of which never gets its probes delivered. The healthy pair
/// still finishes and reports all of its records while the run as a whole
/// stays incomplete.
#[tokio::test]
async fn stalled_pair_does_not_block_other_pairs() -> Result<()> {
    let backend = Arc::new(LoopbackBackend::new(Duration::from_millis(2), Duration::ZERO));
    let shared: Arc<dyn MessagingBackend> = backend.clone();
    let provisioner = Provisioner::new(
        shared,
        CredentialSource::ChatmailDomain("loopback.invalid".to_string()),
    );
    let accounts = provisioner.provision(4).await?;
    let pairs = pair_accounts(&accounts, 2).await?;

    // Account 3 is the ponger of the second pair.
    backend.stall(&accounts[3].addr).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tasks = spawn_pairs(&pairs, 3, 1, LogLevel::Error, tx)?;

    let mut first_pair = Vec::new();
    timeout(Duration::from_secs(5), async {
        while first_pair.len() < 3 {
            let record = rx.recv().await.expect("results channel open");
            assert_eq!(record.pair, 0, "stalled pair reported a record");
            first_pair.push(record.seq);
        }
    })
    .await?;
    assert_eq!(first_pair, vec![0, 1, 2]);

    let run = timeout(Duration::from_millis(200), wait_for_all(tasks, "ping-pong")).await;
    assert!(run.is_err(), "run finished although a pair is stalled");
    Ok(())
}
