//! # Windowed Ping/Pong Protocol
//!
//! A [`Pinger`] sends sequence-numbered probes into its chat, keeping up to
//! `window` of them in flight, and times each one until its echo returns. A
//! [`Ponger`] sends back every text it receives, unchanged.
//!
//! ## Pinger States
//!
//! - **Filling**: fewer than `window` probes in flight, more to send
//! - **Steady**: exactly `window` in flight; each echo is followed by one send
//! - **Draining**: every probe sent, waiting for the remaining echoes
//! - **Done**: every probe answered
//!
//! Echoes may come back in any order. They are matched by the sequence number
//! in their text, never by arrival position. An echo that matches nothing in
//! flight is logged and skipped. Every message either role handles is marked
//! as seen.
//!
//! Both roles stop after `num_pings` messages; no sentinel message is sent.

use crate::{
    backend::{Account, ChatId, Event, MessageSnapshot},
    elapsed::Elapsed,
    error::BenchError,
    logging::LogLevel,
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Latency of one answered probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRecord {
    pub pair: usize,
    pub seq: u64,
    pub elapsed: Duration,
}

impl ResultRecord {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Renders the `<seq>,<elapsed-seconds>` output line.
impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.seq, self.elapsed_secs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerState {
    Filling,
    Steady,
    Draining,
    Done,
}

/// Probe bookkeeping for one pinger: the window and its pending map.
#[derive(Debug)]
pub struct ProbeWindow {
    window: usize,
    num_pings: u64,
    next_seq: u64,
    completed: u64,
    pending: HashMap<u64, Elapsed>,
}

impl ProbeWindow {
    /// Fails if the window is empty or larger than the number of probes.
    pub fn new(window: usize, num_pings: u64) -> Result<Self, BenchError> {
        if window == 0 {
            return Err(BenchError::ZeroWindow);
        }
        if window as u64 > num_pings {
            return Err(BenchError::WindowExceedsPings { window, num_pings });
        }
        Ok(Self {
            window,
            num_pings,
            next_seq: 0,
            completed: 0,
            pending: HashMap::with_capacity(window),
        })
    }

    /// Start the next probe if the window has room and probes remain.
    ///
    /// The returned sequence number is timed from this call on.
    pub fn begin_probe(&mut self) -> Option<u64> {
        if self.pending.len() >= self.window || self.next_seq >= self.num_pings {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, Elapsed::start());
        Some(seq)
    }

    /// Match an echoed payload against the probes in flight.
    pub fn complete(&mut self, pair: usize, payload: &str) -> Result<ResultRecord, BenchError> {
        let unexpected = || BenchError::UnexpectedEcho {
            payload: payload.to_string(),
        };
        let seq: u64 = payload.trim().parse().map_err(|_| unexpected())?;
        let started = self.pending.remove(&seq).ok_or_else(unexpected)?;
        self.completed += 1;
        Ok(ResultRecord {
            pair,
            seq,
            elapsed: started.elapsed(),
        })
    }

    pub fn state(&self) -> PingerState {
        if self.next_seq < self.num_pings {
            if self.pending.len() < self.window {
                PingerState::Filling
            } else {
                PingerState::Steady
            }
        } else if self.pending.is_empty() {
            PingerState::Done
        } else {
            PingerState::Draining
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn sent(&self) -> u64 {
        self.next_seq
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn is_done(&self) -> bool {
        self.state() == PingerState::Done
    }
}

/// Sends probes into one chat and reports each round trip.
pub struct Pinger {
    pair: usize,
    account: Arc<dyn Account>,
    chat: ChatId,
    probes: ProbeWindow,
    log_level: LogLevel,
}

impl Pinger {
    /// Validates the window before anything is sent.
    pub fn new(
        pair: usize,
        account: Arc<dyn Account>,
        chat: ChatId,
        window: usize,
        num_pings: u64,
        log_level: LogLevel,
    ) -> Result<Self, BenchError> {
        Ok(Self {
            pair,
            account,
            chat,
            probes: ProbeWindow::new(window, num_pings)?,
            log_level,
        })
    }

    /// Run until every probe has been answered.
    ///
    /// Records are pushed to `results` as soon as each echo arrives.
    pub async fn run(mut self, results: mpsc::UnboundedSender<ResultRecord>) -> Result<()> {
        self.send_available().await?;

        while !self.probes.is_done() {
            let echo = self.next_echo().await?;
            match self.probes.complete(self.pair, &echo.text) {
                Ok(record) => results.send(record).map_err(|_| {
                    anyhow!("pair {}: results collector stopped", self.pair)
                })?,
                Err(e) => warn!(pair = self.pair, "Ignoring {}", e),
            }
            self.account.mark_seen(echo.id).await?;
            self.send_available().await?;
        }

        debug!(
            pair = self.pair,
            "Pinger done after {} probes",
            self.probes.completed()
        );
        Ok(())
    }

    async fn send_available(&mut self) -> Result<()> {
        while let Some(seq) = self.probes.begin_probe() {
            self.account
                .send_text(self.chat, &seq.to_string())
                .await
                .with_context(|| format!("pair {}: failed to send probe {}", self.pair, seq))?;
        }
        Ok(())
    }

    async fn next_echo(&self) -> Result<MessageSnapshot> {
        loop {
            let event = self.account.wait_for_event().await?;
            if event.log_diagnostic(self.log_level, "ping", self.pair) {
                continue;
            }
            if let Event::IncomingMessage { chat_id, msg_id } = event {
                if chat_id != self.chat {
                    debug!(pair = self.pair, "Ignoring message in {}", chat_id);
                    continue;
                }
                return self.account.get_message(msg_id).await;
            }
        }
    }
}

/// Echoes a fixed number of incoming texts back to their chat.
pub struct Ponger {
    pair: usize,
    account: Arc<dyn Account>,
    num_pings: u64,
    log_level: LogLevel,
}

impl Ponger {
    pub fn new(pair: usize, account: Arc<dyn Account>, num_pings: u64, log_level: LogLevel) -> Self {
        Self {
            pair,
            account,
            num_pings,
            log_level,
        }
    }

    /// Echo `num_pings` messages in arrival order.
    pub async fn run(self) -> Result<()> {
        let mut echoed = 0;
        while echoed < self.num_pings {
            let event = self.account.wait_for_event().await?;
            if event.log_diagnostic(self.log_level, "pong", self.pair) {
                continue;
            }
            if let Event::IncomingMessage { msg_id, .. } = event {
                let snapshot = self.account.get_message(msg_id).await?;
                self.account
                    .send_text(snapshot.chat_id, &snapshot.text)
                    .await
                    .with_context(|| format!("pair {}: failed to echo {}", self.pair, msg_id))?;
                self.account.mark_seen(msg_id).await?;
                echoed += 1;
            }
        }
        debug!(pair = self.pair, "Ponger done after {} echoes", echoed);
        Ok(())
    }
}
