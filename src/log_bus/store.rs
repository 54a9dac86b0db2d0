//! Persistent log store
//!
//! Records are appended to one JSON-lines file per UTC day, named
//! `YYYY-MM-DD`. Queries read day files newest-first and filter in memory.
//! A purge loop deletes the oldest day files while the directory exceeds
//! its disk budget.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::dir_size;
use crate::error::Result;
use crate::log_bus::{LogRecord, Logger};

const PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Query over the persistent store. Empty filters match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub levels: Vec<u8>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub monitors: Vec<String>,
    /// Exclusive upper bound, microseconds since epoch.
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogQuery {
    /// Whether a record passes the query's filters.
    pub fn matches(&self, record: &LogRecord) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&u8::from(record.level)) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&record.src) {
            return false;
        }
        if !self.monitors.is_empty() && !self.monitors.contains(&record.monitor_id) {
            return false;
        }
        if let Some(before) = self.time {
            if record.time >= before {
                return false;
            }
        }
        true
    }
}

/// Day-bucketed log store.
pub struct LogStore {
    dir: PathBuf,
    disk_budget: u64,
}

impl LogStore {
    pub fn new(dir: PathBuf, disk_budget: u64) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, disk_budget })
    }

    fn day_file(&self, time_us: i64) -> PathBuf {
        let day = Utc
            .timestamp_micros(time_us)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();
        self.dir.join(day)
    }

    async fn append(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_file(record.time))
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Subscribe to the bus and persist every record until cancellation.
    pub fn save_logs(self: &Arc<Self>, token: CancellationToken, logger: Arc<Logger>) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut feed = logger.subscribe().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        feed.cancel().await;
                        return;
                    }
                    record = feed.recv() => {
                        let Some(record) = record else { return };
                        if let Err(e) = store.append(&record).await {
                            tracing::error!(error = %e, "could not save log record");
                        }
                    }
                }
            }
        });
    }

    /// Read matching records newest-first.
    pub async fn query(&self, q: LogQuery) -> Result<Vec<LogRecord>> {
        let limit = q.limit.unwrap_or(100);
        let mut days = self.day_files().await?;
        days.sort();
        days.reverse();

        let mut out = Vec::new();
        for day in days {
            if out.len() >= limit {
                break;
            }
            let content = tokio::fs::read_to_string(&day).await?;
            // Lines are appended chronologically, so iterate reversed for
            // newest-first within the day.
            for line in content.lines().rev() {
                if out.len() >= limit {
                    break;
                }
                let Ok(record) = serde_json::from_str::<LogRecord>(line) else {
                    continue;
                };
                if q.matches(&record) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    async fn day_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    /// Delete oldest day files while the store exceeds its disk budget.
    pub fn purge_loop(self: &Arc<Self>, token: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = store.purge().await {
                    tracing::error!(error = %e, "log store purge failed");
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(PURGE_INTERVAL) => {}
                }
            }
        });
    }

    async fn purge(&self) -> Result<()> {
        while dir_size(&self.dir) > self.disk_budget {
            let mut days = self.day_files().await?;
            days.sort();
            let Some(oldest) = days.first() else { return Ok(()) };
            tokio::fs::remove_file(oldest).await?;
        }
        Ok(())
    }
}
