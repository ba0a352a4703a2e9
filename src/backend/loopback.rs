//! In-process messaging backend.
//!
//! Accounts live in a shared [`Network`] keyed by address. Sending a text
//! schedules delivery to the peer after the configured latency plus a random
//! jitter, so echoes inside a window can overtake each other the same way
//! they do on a real mail transport. Addresses can be stalled, after which
//! nothing sent to them is ever delivered.

use super::{Account, ChatId, ContactId, Event, MessageSnapshot, MessagingBackend, MsgId};
use crate::error::BenchError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Simulated backend shared by every account it creates.
pub struct LoopbackBackend {
    network: Arc<Network>,
    latency: Duration,
    jitter: Duration,
}

#[derive(Default)]
struct Network {
    next_account_id: AtomicU32,
    accounts: Mutex<HashMap<String, Arc<AccountState>>>,
    stalled: Mutex<HashSet<String>>,
}

struct AccountState {
    id: u32,
    config: Mutex<HashMap<String, String>>,
    configured: AtomicBool,
    io_started: AtomicBool,
    store: Mutex<Store>,
    events: mpsc::UnboundedSender<Event>,
}

/// Contacts, chats and messages of one account.
#[derive(Default)]
struct Store {
    next_id: u32,
    contacts: HashMap<ContactId, String>,
    chats: HashMap<ChatId, String>,
    chat_by_peer: HashMap<String, ChatId>,
    messages: HashMap<MsgId, MessageSnapshot>,
    seen: HashSet<MsgId>,
}

impl Store {
    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn chat_with(&mut self, peer: &str) -> ChatId {
        if let Some(chat) = self.chat_by_peer.get(peer) {
            return *chat;
        }
        let chat = ChatId(self.allocate());
        self.chats.insert(chat, peer.to_string());
        self.chat_by_peer.insert(peer.to_string(), chat);
        chat
    }

    fn store_message(&mut self, chat_id: ChatId, text: &str) -> MsgId {
        let id = MsgId(self.allocate());
        self.messages.insert(
            id,
            MessageSnapshot {
                id,
                chat_id,
                text: text.to_string(),
            },
        );
        id
    }
}

impl LoopbackBackend {
    /// Create a backend delivering each message after `latency` plus up to
    /// `jitter` of random extra delay.
    pub fn new(latency: Duration, jitter: Duration) -> Self {
        Self {
            network: Arc::new(Network::default()),
            latency,
            jitter,
        }
    }

    /// Number of messages the account at `addr` has marked as seen.
    pub async fn seen_count(&self, addr: &str) -> usize {
        let state = match self.network.accounts.lock().await.get(addr) {
            Some(state) => Arc::clone(state),
            None => return 0,
        };
        let seen = state.store.lock().await.seen.len();
        seen
    }

    /// Drop every message sent to `addr` from now on.
    pub async fn stall(&self, addr: &str) {
        self.network.stalled.lock().await.insert(addr.to_string());
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new(crate::defaults::LOOPBACK_LATENCY, Duration::ZERO)
    }
}

impl Network {
    async fn deliver(&self, from: &str, to: &str, text: &str) {
        if self.stalled.lock().await.contains(to) {
            debug!("Holding message for stalled address {}", to);
            return;
        }
        let peer = match self.accounts.lock().await.get(to) {
            Some(peer) => Arc::clone(peer),
            None => {
                warn!("No loopback account for address {}", to);
                return;
            }
        };

        let (chat_id, msg_id) = {
            let mut store = peer.store.lock().await;
            let chat_id = store.chat_with(from);
            (chat_id, store.store_message(chat_id, text))
        };
        // The receiver is gone once its account handle is dropped.
        let _ = peer.events.send(Event::IncomingMessage { chat_id, msg_id });
    }
}

#[async_trait]
impl MessagingBackend for LoopbackBackend {
    async fn add_account(&self) -> Result<Arc<dyn Account>> {
        let id = self.network.next_account_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AccountState {
            id,
            config: Mutex::new(HashMap::new()),
            configured: AtomicBool::new(false),
            io_started: AtomicBool::new(false),
            store: Mutex::new(Store::default()),
            events: tx,
        });
        Ok(Arc::new(LoopbackAccount {
            state,
            network: Arc::clone(&self.network),
            events: Mutex::new(rx),
            latency: self.latency,
            jitter: self.jitter,
        }))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

/// Account handle on a [`LoopbackBackend`].
pub struct LoopbackAccount {
    state: Arc<AccountState>,
    network: Arc<Network>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
    latency: Duration,
    jitter: Duration,
}

impl LoopbackAccount {
    async fn addr(&self) -> Result<String> {
        self.state
            .config
            .lock()
            .await
            .get("addr")
            .cloned()
            .ok_or_else(|| BenchError::MissingAddress { account: self.state.id }.into())
    }

    fn emit(&self, event: Event) {
        let _ = self.state.events.send(event);
    }

    fn delivery_delay(&self) -> Duration {
        let jitter_us = self.jitter.as_micros() as u64;
        if jitter_us == 0 {
            return self.latency;
        }
        self.latency + Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_us))
    }
}

#[async_trait]
impl Account for LoopbackAccount {
    fn id(&self) -> u32 {
        self.state.id
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .config
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.config.lock().await.get(key).cloned())
    }

    async fn is_configured(&self) -> Result<bool> {
        Ok(self.state.configured.load(Ordering::SeqCst))
    }

    async fn configure(&self) -> Result<()> {
        let addr = self.addr().await?;
        if self.get_config("mail_pw").await?.is_none() {
            return Err(anyhow!("account {}: mail_pw is not set", self.state.id));
        }

        {
            let mut accounts = self.network.accounts.lock().await;
            if let Some(existing) = accounts.get(&addr) {
                if existing.id != self.state.id {
                    return Err(anyhow!("address {} is already in use", addr));
                }
            }
            accounts.insert(addr.clone(), Arc::clone(&self.state));
        }

        self.state.configured.store(true, Ordering::SeqCst);
        self.emit(Event::Info(format!("Configured {}", addr)));
        Ok(())
    }

    async fn start_io(&self) -> Result<()> {
        if !self.state.configured.load(Ordering::SeqCst) {
            return Err(BenchError::NotConfigured { account: self.state.id }.into());
        }
        self.state.io_started.store(true, Ordering::SeqCst);
        self.emit(Event::Info("IO started".to_string()));
        Ok(())
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
        self.state
            .store
            .lock()
            .await
            .messages
            .get(&msg_id)
            .cloned()
            .ok_or_else(|| {
                BenchError::UnknownMessage {
                    account: self.state.id,
                    msg: msg_id.0,
                }
                .into()
            })
    }

    async fn mark_seen(&self, msg_id: MsgId) -> Result<()> {
        let mut store = self.state.store.lock().await;
        if !store.messages.contains_key(&msg_id) {
            return Err(BenchError::UnknownMessage {
                account: self.state.id,
                msg: msg_id.0,
            }
            .into());
        }
        store.seen.insert(msg_id);
        Ok(())
    }

    async fn create_contact(&self, addr: &str) -> Result<ContactId> {
        let mut store = self.state.store.lock().await;
        if let Some((id, _)) = store.contacts.iter().find(|(_, known)| *known == addr) {
            return Ok(*id);
        }
        let id = ContactId(store.allocate());
        store.contacts.insert(id, addr.to_string());
        Ok(id)
    }

    async fn create_chat(&self, contact: ContactId) -> Result<ChatId> {
        let mut store = self.state.store.lock().await;
        let peer = store
            .contacts
            .get(&contact)
            .cloned()
            .ok_or_else(|| anyhow!("account {} has no contact {}", self.state.id, contact.0))?;
        Ok(store.chat_with(&peer))
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MsgId> {
        if !self.state.io_started.load(Ordering::SeqCst) {
            return Err(BenchError::IoNotStarted { account: self.state.id }.into());
        }
        let from = self.addr().await?;
        let (peer, msg_id) = {
            let mut store = self.state.store.lock().await;
            let peer = store
                .chats
                .get(&chat)
                .cloned()
                .ok_or(BenchError::UnknownChat {
                    account: self.state.id,
                    chat: chat.0,
                })?;
            (peer, store.store_message(chat, text))
        };

        let delay = self.delivery_delay();
        let network = Arc::clone(&self.network);
        let text = text.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            network.deliver(&from, &peer, &text).await;
        });

        Ok(msg_id)
    }
}
