//! Account provisioning and pairing.
//!
//! All accounts are created concurrently, one task each, and every one of
//! them must come up: the first failure aborts the remaining creations and
//! the run. Pairing happens afterwards, once every account is I/O-active.

use crate::{
    backend::{Account, ChatId, MessagingBackend},
    credentials::CredentialSource,
    elapsed::Elapsed,
    error::BenchError,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Settings applied to every account before configuring it.
///
/// Bot mode on; self-copies, mailbox moves, read receipts and end-to-end
/// encryption off so nothing but the probe traffic is timed.
pub const ACCOUNT_SETTINGS: &[(&str, &str)] = &[
    ("bot", "1"),
    ("bcc_self", "0"),
    ("mvbox_move", "0"),
    ("mdns_enabled", "0"),
    ("e2ee_enabled", "0"),
    ("mail_port", "993"),
    ("send_port", "465"),
    ("socks5_enabled", "0"),
    ("socks5_host", "127.0.0.1"),
    ("socks5_port", "9050"),
];

/// A configured, I/O-active account.
#[derive(Clone)]
pub struct ProvisionedAccount {
    pub account: Arc<dyn Account>,
    pub addr: String,
}

/// One pinger/ponger pair and the chat between them.
#[derive(Clone)]
pub struct Pair {
    pub index: usize,
    pub pinger: Arc<dyn Account>,
    pub ponger: Arc<dyn Account>,
    /// Chat on the pinger's side.
    pub chat: ChatId,
}

/// Creates accounts on a backend.
pub struct Provisioner {
    backend: Arc<dyn MessagingBackend>,
    credentials: Arc<CredentialSource>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn MessagingBackend>, credentials: CredentialSource) -> Self {
        Self {
            backend,
            credentials: Arc::new(credentials),
        }
    }

    /// Bring up `count` accounts concurrently, returned in creation order.
    pub async fn provision(&self, count: usize) -> Result<Vec<ProvisionedAccount>> {
        let timer = Elapsed::start();
        let mut tasks = JoinSet::new();
        for index in 0..count {
            let backend = Arc::clone(&self.backend);
            let credentials = Arc::clone(&self.credentials);
            tasks.spawn(async move {
                let account = create_account(backend.as_ref(), credentials.as_ref())
                    .await
                    .with_context(|| format!("Failed to provision account {}", index))?;
                Ok((index, account))
            });
        }

        let mut accounts = wait_for_all(tasks, "provisioning").await?;
        accounts.sort_by_key(|(index, _)| *index);
        info!(
            "Configured {} accounts on {} backend in {}s",
            count,
            self.backend.name(),
            timer
        );
        Ok(accounts.into_iter().map(|(_, account)| account).collect())
    }
}

async fn create_account(
    backend: &dyn MessagingBackend,
    credentials: &CredentialSource,
) -> Result<ProvisionedAccount> {
    let creds = credentials.obtain().await?;
    let account = backend.add_account().await?;

    for (key, value) in ACCOUNT_SETTINGS {
        account
            .set_config(key, value)
            .await
            .with_context(|| format!("Failed to set {}", key))?;
    }

    if account.is_configured().await? {
        return Err(BenchError::AlreadyConfigured {
            account: account.id(),
        }
        .into());
    }

    account.set_config("addr", &creds.addr).await?;
    account.set_config("mail_pw", &creds.password).await?;
    account
        .configure()
        .await
        .with_context(|| format!("Failed to configure {}", creds.addr))?;
    account.start_io().await?;
    debug!("Account {} ({}) is up", account.id(), creds.addr);

    Ok(ProvisionedAccount {
        account,
        addr: creds.addr,
    })
}

/// Link accounts `2i` (ping) and `2i + 1` (pong) into `pairs` pairs.
pub async fn pair_accounts(accounts: &[ProvisionedAccount], pairs: usize) -> Result<Vec<Pair>> {
    if accounts.len() < pairs * 2 {
        anyhow::bail!(
            "{} pairs need {} accounts, only {} provisioned",
            pairs,
            pairs * 2,
            accounts.len()
        );
    }

    let mut linked = Vec::with_capacity(pairs);
    for (index, chunk) in accounts.chunks_exact(2).take(pairs).enumerate() {
        let (ping, pong) = (&chunk[0], &chunk[1]);
        let pong_addr = pong
            .account
            .get_config("addr")
            .await?
            .ok_or(BenchError::MissingAddress {
                account: pong.account.id(),
            })?;
        let contact = ping.account.create_contact(&pong_addr).await?;
        let chat = ping.account.create_chat(contact).await?;
        debug!("Pair {}: {} -> {} on {}", index, ping.addr, pong_addr, chat);

        linked.push(Pair {
            index,
            pinger: Arc::clone(&ping.account),
            ponger: Arc::clone(&pong.account),
            chat,
        });
    }
    Ok(linked)
}

/// Await every task in `tasks`, propagating the first error.
///
/// Returning early drops the set, which aborts the tasks still running.
pub async fn wait_for_all<T: 'static>(
    mut tasks: JoinSet<Result<T>>,
    phase: &'static str,
) -> Result<Vec<T>> {
    let total = tasks.len();
    let mut outputs = Vec::with_capacity(total);
    while let Some(joined) = tasks.join_next().await {
        let output = joined.with_context(|| format!("{} task panicked or was cancelled", phase))??;
        outputs.push(output);
    }
    if outputs.len() != total {
        return Err(BenchError::IncompleteTasks {
            phase,
            pending: total - outputs.len(),
            total,
        }
        .into());
    }
    Ok(outputs)
}
