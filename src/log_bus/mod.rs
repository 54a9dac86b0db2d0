//! Log bus - process-wide log distribution
//!
//! ## Responsibilities
//!
//! - Publish/subscribe fan-out of structured log records
//! - Source registry for the query UI
//! - Mirror every record into `tracing` for operator output
//!
//! Producers publish to a single internal channel. The dispatcher owns the
//! subscriber set; subscribe and unsubscribe are control messages handled in
//! the same select loop, so an unsubscribing consumer can never deadlock the
//! dispatcher (it keeps draining its own feed until the request is accepted).
//! Slow subscribers stall the bus briefly; subscribers are all in-process and
//! short-running, media never flows through this channel.

pub mod store;

pub use store::{LogQuery, LogStore};

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Log levels, matching ffmpeg's numeric levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> u8 {
        match level {
            LogLevel::Error => 16,
            LogLevel::Warning => 24,
            LogLevel::Info => 32,
            LogLevel::Debug => 48,
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            16 => Ok(LogLevel::Error),
            24 => Ok(LogLevel::Warning),
            32 => Ok(LogLevel::Info),
            48 => Ok(LogLevel::Debug),
            _ => Err(format!("invalid log level: {v}")),
        }
    }
}

/// A single log record. `time` is microseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub time: i64,
    pub msg: String,
    pub src: String,
    #[serde(rename = "monitorID", default)]
    pub monitor_id: String,
}

/// Builtin producer names. Addon hooks may register more.
const BUILTIN_SOURCES: &[&str] = &[
    "app", "monitors", "recorder", "storage", "watchdog", "motion", "ffmpeg",
];

enum Control {
    Subscribe(mpsc::Sender<LogRecord>, oneshot::Sender<u64>),
    Unsubscribe(u64),
}

/// Process-wide log bus handle. Cheap to clone via `Arc`.
pub struct Logger {
    feed_tx: mpsc::Sender<LogRecord>,
    control_tx: mpsc::Sender<Control>,
    sources: Vec<String>,
}

impl Logger {
    /// Create the bus and spawn its dispatcher. `extra_sources` come from
    /// the hook set assembled at startup.
    pub fn new(token: CancellationToken, extra_sources: &[&str]) -> Self {
        let (feed_tx, mut feed_rx) = mpsc::channel::<LogRecord>(64);
        let (control_tx, mut control_rx) = mpsc::channel::<Control>(16);

        let mut sources: Vec<String> = BUILTIN_SOURCES.iter().map(|s| s.to_string()).collect();
        sources.extend(extra_sources.iter().map(|s| s.to_string()));
        sources.sort();
        sources.dedup();

        tokio::spawn(async move {
            let mut subs: HashMap<u64, mpsc::Sender<LogRecord>> = HashMap::new();
            let mut next_id: u64 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    Some(ctl) = control_rx.recv() => match ctl {
                        Control::Subscribe(tx, ack) => {
                            let id = next_id;
                            next_id += 1;
                            subs.insert(id, tx);
                            let _ = ack.send(id);
                        }
                        Control::Unsubscribe(id) => {
                            subs.remove(&id);
                        }
                    },
                    Some(record) = feed_rx.recv() => {
                        mirror_to_tracing(&record);
                        let mut dead = Vec::new();
                        for (id, tx) in &subs {
                            if tx.send(record.clone()).await.is_err() {
                                dead.push(*id);
                            }
                        }
                        for id in dead {
                            subs.remove(&id);
                        }
                    }
                }
            }
        });

        Self {
            feed_tx,
            control_tx,
            sources,
        }
    }

    /// Registered producer names, sorted.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Subscribe to all records produced after this call.
    pub async fn subscribe(&self) -> Feed {
        let (tx, rx) = mpsc::channel(64);
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self
            .control_tx
            .send(Control::Subscribe(tx, ack_tx))
            .await;
        let id = ack_rx.await.unwrap_or(u64::MAX);
        Feed {
            rx,
            id,
            since: Utc::now().timestamp_micros(),
            control_tx: self.control_tx.clone(),
        }
    }

    pub fn error(&self) -> LogEvent<'_> {
        self.event(LogLevel::Error)
    }

    pub fn warn(&self) -> LogEvent<'_> {
        self.event(LogLevel::Warning)
    }

    pub fn info(&self) -> LogEvent<'_> {
        self.event(LogLevel::Info)
    }

    pub fn debug(&self) -> LogEvent<'_> {
        self.event(LogLevel::Debug)
    }

    fn event(&self, level: LogLevel) -> LogEvent<'_> {
        LogEvent {
            logger: self,
            level,
            src: String::new(),
            monitor_id: String::new(),
        }
    }

    async fn send(&self, record: LogRecord) {
        let _ = self.feed_tx.send(record).await;
    }
}

/// Builder for one record. Call `msg` to send.
pub struct LogEvent<'a> {
    logger: &'a Logger,
    level: LogLevel,
    src: String,
    monitor_id: String,
}

impl LogEvent<'_> {
    pub fn source(mut self, src: impl Into<String>) -> Self {
        self.src = src.into();
        self
    }

    pub fn monitor(mut self, monitor_id: impl Into<String>) -> Self {
        self.monitor_id = monitor_id.into();
        self
    }

    pub async fn msg(self, msg: impl Into<String>) {
        let record = LogRecord {
            level: self.level,
            time: Utc::now().timestamp_micros(),
            msg: msg.into(),
            src: self.src,
            monitor_id: self.monitor_id,
        };
        self.logger.send(record).await;
    }
}

/// An active subscription. `cancel` keeps draining the feed until the
/// dispatcher accepts the unsubscribe, mirroring the bus contract.
pub struct Feed {
    rx: mpsc::Receiver<LogRecord>,
    id: u64,
    since: i64,
    control_tx: mpsc::Sender<Control>,
}

impl Feed {
    /// Receive the next record produced after the subscription was taken.
    /// Records that were still queued on the bus when the subscription
    /// registered are dropped, never replayed.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            let record = self.rx.recv().await?;
            if record.time >= self.since {
                return Some(record);
            }
        }
    }

    pub async fn cancel(mut self) {
        loop {
            tokio::select! {
                res = self.control_tx.send(Control::Unsubscribe(self.id)) => {
                    let _ = res;
                    return;
                }
                _ = self.rx.recv() => {}
            }
        }
    }
}

fn mirror_to_tracing(record: &LogRecord) {
    let monitor = record.monitor_id.as_str();
    let src = record.src.as_str();
    match record.level {
        LogLevel::Error => tracing::error!(%src, %monitor, "{}", record.msg),
        LogLevel::Warning => tracing::warn!(%src, %monitor, "{}", record.msg),
        LogLevel::Info => tracing::info!(%src, %monitor, "{}", record.msg),
        LogLevel::Debug => tracing::debug!(%src, %monitor, "{}", record.msg),
    }
}
