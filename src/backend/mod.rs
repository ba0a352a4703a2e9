//! Messaging backend capability surface.
//!
//! The benchmark never talks to a chat server directly. Everything it needs
//! from the backend (account lifecycle, event delivery, contacts, chats and
//! sending text) goes through the [`MessagingBackend`] and [`Account`] traits.
//! Two implementations are provided:
//!
//! - [`RpcBackend`]: a `deltachat-rpc-server` child process spoken to over
//!   JSON-RPC on stdio
//! - [`LoopbackBackend`]: an in-process network with configurable latency,
//!   used for tests and dry runs

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::logging::{LogLevel, Severity};

pub mod loopback;
pub mod rpc;

pub use loopback::LoopbackBackend;
pub use rpc::RpcBackend;

/// Chat identifier, scoped to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub u32);

/// Contact identifier, scoped to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub u32);

/// Message identifier, scoped to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgId(pub u32);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat#{}", self.0)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// Events the benchmark reacts to.
///
/// Backend events outside this set are dropped by the adapters before they
/// reach an account's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Info(String),
    Warning(String),
    Error(String),
    IncomingMessage { chat_id: ChatId, msg_id: MsgId },
}

impl Event {
    /// Log a diagnostic event if `filter` surfaces its severity.
    ///
    /// Returns `true` for diagnostic events (handled here) and `false` for
    /// incoming messages, which the caller must process.
    pub fn log_diagnostic(&self, filter: LogLevel, role: &str, pair: usize) -> bool {
        match self {
            Event::Info(msg) => {
                if filter.surfaces(Severity::Info) {
                    info!(target: "backend", pair, role, "{}", msg);
                }
                true
            }
            Event::Warning(msg) => {
                if filter.surfaces(Severity::Warning) {
                    warn!(target: "backend", pair, role, "{}", msg);
                }
                true
            }
            Event::Error(msg) => {
                if filter.surfaces(Severity::Error) {
                    error!(target: "backend", pair, role, "{}", msg);
                }
                true
            }
            Event::IncomingMessage { msg_id, .. } => {
                debug!(pair, role, "Got an incoming message {}", msg_id);
                false
            }
        }
    }
}

/// Snapshot of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub id: MsgId,
    pub chat_id: ChatId,
    pub text: String,
}

/// One provisioned identity on the backend.
///
/// Handles are exclusive to the task that owns them during the ping phase;
/// implementations only need interior mutability for their event queue.
#[async_trait]
pub trait Account: Send + Sync {
    /// Backend-local account identifier.
    fn id(&self) -> u32;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    async fn is_configured(&self) -> Result<bool>;

    /// Run the configure handshake with the credentials set via `set_config`.
    async fn configure(&self) -> Result<()>;

    /// Start background message delivery.
    async fn start_io(&self) -> Result<()>;

    /// Block until the next event for this account arrives.
    async fn wait_for_event(&self) -> Result<Event>;

    async fn get_message(&self, msg_id: MsgId) -> Result<MessageSnapshot>;

    /// Mark a received message as seen on the server.
    async fn mark_seen(&self, msg_id: MsgId) -> Result<()>;

    async fn create_contact(&self, addr: &str) -> Result<ContactId>;

    async fn create_chat(&self, contact: ContactId) -> Result<ChatId>;

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MsgId>;
}

/// Factory for accounts on one backend instance.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn add_account(&self) -> Result<Arc<dyn Account>>;

    /// Backend name for identification in logs.
    fn name(&self) -> &'static str;
}

/// Which backend implementation to run against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
pub enum BackendKind {
    /// deltachat-rpc-server over JSON-RPC
    #[clap(name = "rpc")]
    Rpc,

    /// In-process simulated network
    #[clap(name = "loopback")]
    Loopback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Rpc => write!(f, "JSON-RPC"),
            BackendKind::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Backend construction parameters.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub rpc_server: String,
    pub loopback_latency: Duration,
    pub loopback_jitter: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Rpc,
            rpc_server: crate::defaults::RPC_SERVER.to_string(),
            loopback_latency: crate::defaults::LOOPBACK_LATENCY,
            loopback_jitter: Duration::ZERO,
        }
    }
}

/// Backend factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend storing account state below `accounts_dir`.
    pub fn create(config: &BackendConfig, accounts_dir: &Path) -> Result<Arc<dyn MessagingBackend>> {
        match config.kind {
            BackendKind::Rpc => Ok(Arc::new(RpcBackend::spawn(&config.rpc_server, accounts_dir)?)),
            BackendKind::Loopback => Ok(Arc::new(LoopbackBackend::new(
                config.loopback_latency,
                config.loopback_jitter,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_events_are_handled() {
        let pair = 0;
        assert!(Event::Info("hello".into()).log_diagnostic(LogLevel::Error, "ping", pair));
        assert!(Event::Warning("careful".into()).log_diagnostic(LogLevel::Info, "ping", pair));
        assert!(Event::Error("boom".into()).log_diagnostic(LogLevel::Warning, "pong", pair));
    }

    #[test]
    fn test_incoming_message_is_passed_through() {
        let event = Event::IncomingMessage {
            chat_id: ChatId(10),
            msg_id: MsgId(11),
        };
        assert!(!event.log_diagnostic(LogLevel::Info, "pong", 0));
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Rpc.to_string(), "JSON-RPC");
        assert_eq!(BackendKind::Loopback.to_string(), "Loopback");
    }

    #[tokio::test]
    async fn test_factory_creates_loopback() {
        let config = BackendConfig {
            kind: BackendKind::Loopback,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let backend = BackendFactory::create(&config, dir.path()).unwrap();
        assert_eq!(backend.name(), "loopback");
    }
}
