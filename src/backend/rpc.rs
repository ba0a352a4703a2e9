//! JSON-RPC backend driving a `deltachat-rpc-server` child process.
//!
//! Requests and responses are newline-delimited JSON-RPC 2.0 objects on the
//! child's stdin/stdout. A reader task matches responses to callers by id.
//! Events are pulled with `get_next_event` by a background loop and routed
//! to per-account queues by their `contextId`.

use super::{Account, ChatId, ContactId, Event, MessageSnapshot, MessagingBackend, MsgId};
use crate::error::BenchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

type CallResult = std::result::Result<Value, RpcErrorObject>;
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<CallResult>>>>;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Event as delivered by `get_next_event`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventEnvelope {
    context_id: u32,
    event: RawEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum RawEvent {
    Info {
        msg: String,
    },
    Warning {
        msg: String,
    },
    Error {
        msg: String,
    },
    IncomingMsg {
        #[serde(rename = "chatId")]
        chat_id: u32,
        #[serde(rename = "msgId")]
        msg_id: u32,
    },
    #[serde(other)]
    Other,
}

impl RawEvent {
    fn into_event(self) -> Option<Event> {
        match self {
            RawEvent::Info { msg } => Some(Event::Info(msg)),
            RawEvent::Warning { msg } => Some(Event::Warning(msg)),
            RawEvent::Error { msg } => Some(Event::Error(msg)),
            RawEvent::IncomingMsg { chat_id, msg_id } => Some(Event::IncomingMessage {
                chat_id: ChatId(chat_id),
                msg_id: MsgId(msg_id),
            }),
            RawEvent::Other => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageObject {
    id: u32,
    chat_id: u32,
    #[serde(default)]
    text: String,
}

/// Request/response multiplexer over the child's stdio.
pub struct RpcClient {
    next_id: AtomicU64,
    stdin: Mutex<ChildStdin>,
    pending: PendingCalls,
    // Held for kill_on_drop.
    _child: Child,
}

impl RpcClient {
    /// Spawn `program` with its account store in `accounts_dir`.
    pub fn spawn(program: &str, accounts_dir: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .env("DC_ACCOUNTS_PATH", accounts_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn RPC server '{}'", program))?;

        let stdin = child
            .stdin
            .take()
            .context("RPC server stdin is not piped")?;
        let stdout = child
            .stdout
            .take()
            .context("RPC server stdout is not piped")?;

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(Self::read_responses(stdout, Arc::clone(&pending)));

        debug!("Spawned RPC server {} (accounts in {})", program, accounts_dir.display());
        Ok(Self {
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(stdin),
            pending,
            _child: child,
        })
    }

    /// Call `method` and deserialize its result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        trace!("-> {}", line.trim_end());

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(e).with_context(|| format!("Failed to write {} request", method));
        }

        let response = rx.await.map_err(|_| BenchError::BackendClosed)?;
        match response {
            Ok(value) => serde_json::from_value(value)
                .with_context(|| format!("Unexpected result type for {}", method)),
            Err(err) => Err(BenchError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            }
            .into()),
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    async fn read_responses(stdout: ChildStdout, pending: PendingCalls) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    trace!("<- {}", line);
                    let response: RpcResponse = match serde_json::from_str(&line) {
                        Ok(response) => response,
                        Err(e) => {
                            error!("Malformed RPC response: {}", e);
                            continue;
                        }
                    };
                    let Some(id) = response.id else {
                        debug!("Ignoring RPC message without id");
                        continue;
                    };
                    let result = match response.error {
                        Some(err) => Err(err),
                        None => Ok(response.result.unwrap_or(Value::Null)),
                    };
                    if let Some(waiter) = pending.lock().await.remove(&id) {
                        let _ = waiter.send(result);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read from RPC server: {}", e);
                    break;
                }
            }
        }
        // Dropping the senders fails every outstanding call.
        pending.lock().await.clear();
        debug!("RPC response reader finished");
    }
}

/// Routes events to per-account queues.
///
/// Events for an account that has not subscribed yet are buffered and handed
/// over on subscription.
#[derive(Default)]
pub(crate) struct EventRouter {
    senders: HashMap<u32, mpsc::UnboundedSender<Event>>,
    unclaimed: HashMap<u32, mpsc::UnboundedReceiver<Event>>,
}

impl EventRouter {
    pub(crate) fn subscribe(&mut self, account: u32) -> mpsc::UnboundedReceiver<Event> {
        if let Some(rx) = self.unclaimed.remove(&account) {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(account, tx);
        rx
    }

    pub(crate) fn route(&mut self, account: u32, event: Event) {
        if !self.senders.contains_key(&account) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.insert(account, tx);
            self.unclaimed.insert(account, rx);
        }
        if let Some(tx) = self.senders.get(&account) {
            let _ = tx.send(event);
        }
    }

    /// Drop all senders so waiting accounts observe a closed backend.
    pub(crate) fn close(&mut self) {
        self.senders.clear();
    }
}

/// Backend backed by one `deltachat-rpc-server` process.
pub struct RpcBackend {
    client: Arc<RpcClient>,
    router: Arc<Mutex<EventRouter>>,
    event_loop: JoinHandle<()>,
}

impl RpcBackend {
    pub fn spawn(program: &str, accounts_dir: &Path) -> Result<Self> {
        let client = Arc::new(RpcClient::spawn(program, accounts_dir)?);
        let router = Arc::new(Mutex::new(EventRouter::default()));
        let event_loop = tokio::spawn(Self::pump_events(
            Arc::clone(&client),
            Arc::clone(&router),
        ));
        Ok(Self {
            client,
            router,
            event_loop,
        })
    }

    async fn pump_events(client: Arc<RpcClient>, router: Arc<Mutex<EventRouter>>) {
        loop {
            let envelope: EventEnvelope = match client.call("get_next_event", json!([])).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Event loop stopped: {:#}", e);
                    break;
                }
            };
            if let Some(event) = envelope.event.into_event() {
                router.lock().await.route(envelope.context_id, event);
            }
        }
        router.lock().await.close();
    }
}

impl Drop for RpcBackend {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl MessagingBackend for RpcBackend {
    async fn add_account(&self) -> Result<Arc<dyn Account>> {
        let id: u32 = self.client.call("add_account", json!([])).await?;
        let events = self.router.lock().await.subscribe(id);
        Ok(Arc::new(RpcAccount {
            id,
            client: Arc::clone(&self.client),
            events: Mutex::new(events),
        }))
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

/// Account handle on an [`RpcBackend`].
pub struct RpcAccount {
    id: u32,
    client: Arc<RpcClient>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
}

#[async_trait]
impl Account for RpcAccount {
    fn id(&self) -> u32 {
        self.id
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .call("set_config", json!([self.id, key, value]))
            .await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.client.call("get_config", json!([self.id, key])).await
    }

    async fn is_configured(&self) -> Result<bool> {
        self.client.call("is_configured", json!([self.id])).await
    }

    async fn configure(&self) -> Result<()> {
        self.client.call("configure", json!([self.id])).await
    }

    async fn start_io(&self) -> Result<()> {
        self.client.call("start_io", json!([self.id])).await
    }

    async fn wait_for_event(&self) -> Result<Event> {
        self.events
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BenchError::BackendClosed.into())
    }

    async fn get_message(&self, msg_id: MsgId) -> Result<MessageSnapshot> {
        let message: MessageObject = self
            .client
            .call("get_message", json!([self.id, msg_id.0]))
            .await?;
        Ok(MessageSnapshot {
            id: MsgId(message.id),
            chat_id: ChatId(message.chat_id),
            text: message.text,
        })
    }

    async fn mark_seen(&self, msg_id: MsgId) -> Result<()> {
        self.client
            .call("markseen_msgs", json!([self.id, [msg_id.0]]))
            .await
    }

    async fn create_contact(&self, addr: &str) -> Result<ContactId> {
        let id: u32 = self
            .client
            .call("create_contact", json!([self.id, addr, ""]))
            .await?;
        Ok(ContactId(id))
    }

    async fn create_chat(&self, contact: ContactId) -> Result<ChatId> {
        let id: u32 = self
            .client
            .call("create_chat_by_contact_id", json!([self.id, contact.0]))
            .await?;
        Ok(ChatId(id))
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MsgId> {
        let id: u32 = self
            .client
            .call("misc_send_text_message", json!([self.id, chat.0, text]))
            .await?;
        Ok(MsgId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 3,
            method: "set_config",
            params: json!([1, "bot", "1"]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 3, "method": "set_config", "params": [1, "bot", "1"]})
        );
    }

    #[test]
    fn test_error_response_parsing() {
        let response: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-1,"message":"no such account"}}"#,
        )
        .unwrap();
        assert_eq!(response.id, Some(7));
        let err = response.error.unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "no such account");
    }

    #[test]
    fn test_event_envelope_parsing() {
        let envelope: EventEnvelope = serde_json::from_str(
            r#"{"contextId":2,"event":{"kind":"IncomingMsg","chatId":12,"msgId":34}}"#,
        )
        .unwrap();
        assert_eq!(envelope.context_id, 2);
        assert_eq!(
            envelope.event.into_event(),
            Some(Event::IncomingMessage {
                chat_id: ChatId(12),
                msg_id: MsgId(34)
            })
        );

        let warning: EventEnvelope = serde_json::from_str(
            r#"{"contextId":1,"event":{"kind":"Warning","msg":"slow"}}"#,
        )
        .unwrap();
        assert_eq!(
            warning.event.into_event(),
            Some(Event::Warning("slow".to_string()))
        );
    }

    #[test]
    fn test_unknown_event_kinds_are_dropped() {
        let envelope: EventEnvelope = serde_json::from_str(
            r#"{"contextId":1,"event":{"kind":"ConnectivityChanged"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.event.into_event(), None);
    }

    #[test]
    fn test_message_object_parsing() {
        let message: MessageObject = serde_json::from_str(
            r#"{"id":5,"chatId":9,"text":"42","fromId":10,"isBot":true}"#,
        )
        .unwrap();
        assert_eq!(message.id, 5);
        assert_eq!(message.chat_id, 9);
        assert_eq!(message.text, "42");
    }

    #[tokio::test]
    async fn test_router_buffers_events_until_subscribed() {
        let mut router = EventRouter::default();
        router.route(4, Event::Info("early".to_string()));
        let mut rx = router.subscribe(4);
        router.route(4, Event::Info("late".to_string()));

        assert_eq!(rx.recv().await, Some(Event::Info("early".to_string())));
        assert_eq!(rx.recv().await, Some(Event::Info("late".to_string())));
    }

    #[tokio::test]
    async fn test_router_close_ends_streams() {
        let mut router = EventRouter::default();
        let mut rx = router.subscribe(1);
        router.close();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_router_keeps_accounts_apart() {
        let mut router = EventRouter::default();
        let mut first = router.subscribe(1);
        let mut second = router.subscribe(2);
        router.route(2, Event::Error("two".to_string()));
        router.route(1, Event::Error("one".to_string()));

        assert_eq!(first.recv().await, Some(Event::Error("one".to_string())));
        assert_eq!(second.recv().await, Some(Event::Error("two".to_string())));
    }

    /// `cat` echoes each request back; a request object parses as a response
    /// with a matching id and no result, which resolves the call with `null`.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_matches_responses_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let client = RpcClient::spawn("cat", dir.path()).unwrap();
        let (a, b): (Result<()>, Result<()>) = tokio::join!(
            client.call("first", json!([])),
            client.call("second", json!([1, 2]))
        );
        a.unwrap();
        b.unwrap();
    }

    /// A server that closes its stdin but keeps stdout open makes writes
    /// fail while the reader is still waiting; the call must not stay
    /// registered.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_write_unregisters_call() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("deaf-server");
        std::fs::write(&script, "#!/bin/sh\nexec 0<&-\nsleep 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = RpcClient::spawn(script.to_str().unwrap(), dir.path()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let result: Result<()> = client.call("get_next_event", json!([])).await;
        assert!(result.is_err());
        assert!(client.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = RpcClient::spawn("/nonexistent/deltachat-rpc-server", dir.path());
        assert!(result.is_err());
    }
}
