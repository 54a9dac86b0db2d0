//! Storage manager
//!
//! ## Responsibilities
//!
//! - Own the recordings directory tree `recordings/YYYY/MM/DD/<monitor>/`
//! - Query recordings newest-first with optional sidecar inlining
//! - Enforce the soft disk quota by purging oldest days
//!
//! A recording is addressed by its stem `YYYY-MM-DD_hh-mm-ss_<monitorId>`;
//! deleting removes every sibling file of the stem. Recordings without a
//! sidecar (crashed mid-write) are returned without data.

pub mod crawler;

pub use crawler::{RecordingEntry, RecordingQuery};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::dir_size;
use crate::error::{Error, Result};
use crate::log_bus::Logger;

const PURGE_INTERVAL: Duration = Duration::from_secs(600);

/// Extensions making up one recording.
const RECORDING_EXTENSIONS: [&str; 4] = ["meta", "mdat", "jpeg", "json"];

static RECORDING_ID_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}_[A-Za-z0-9_]{1,24}$")
        .expect("static regex")
});

/// Validates a recording id: `YYYY-MM-DD_hh-mm-ss_<monitorId>`.
pub fn valid_recording_id(id: &str) -> bool {
    RECORDING_ID_RE.is_match(id)
}

/// Path of a recording stem (no extension) inside the recordings tree,
/// derived from its id. The date folder comes from the id itself.
pub fn stem_path(recordings_dir: &std::path::Path, id: &str) -> Option<PathBuf> {
    if !valid_recording_id(id) {
        return None;
    }
    let date = &id[..10]; // YYYY-MM-DD
    let monitor = &id[20..];
    Some(
        recordings_dir
            .join(&date[..4])
            .join(&date[5..7])
            .join(&date[8..10])
            .join(monitor)
            .join(id),
    )
}

/// Storage manager for the recordings tree.
pub struct StorageManager {
    recordings_dir: PathBuf,
    disk_budget: u64,
    logger: Arc<Logger>,
}

impl StorageManager {
    pub fn new(recordings_dir: PathBuf, disk_budget: u64, logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            recordings_dir,
            disk_budget,
            logger,
        })
    }

    pub fn recordings_dir(&self) -> &std::path::Path {
        &self.recordings_dir
    }

    /// Delete all files of one recording. Not-found when nothing matched.
    pub async fn delete_recording(&self, id: &str) -> Result<()> {
        let base = stem_path(&self.recordings_dir, id)
            .ok_or_else(|| Error::Validation(format!("invalid recording id: {id}")))?;

        let mut removed = false;
        for ext in RECORDING_EXTENSIONS {
            if tokio::fs::remove_file(base.with_extension(ext)).await.is_ok() {
                removed = true;
            }
        }
        if !removed {
            return Err(Error::NotFound(format!("recording: {id}")));
        }
        Ok(())
    }

    /// Background loop enforcing the disk quota every 10 minutes: whole
    /// oldest days are removed first, matching the day-granular tree.
    pub fn purge_loop(self: &Arc<Self>, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = manager.purge().await {
                    manager
                        .logger
                        .error()
                        .source("storage")
                        .msg(format!("purge: {e}"))
                        .await;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(PURGE_INTERVAL) => {}
                }
            }
        });
    }

    async fn purge(&self) -> Result<()> {
        while dir_size(&self.recordings_dir) > self.disk_budget {
            let Some(oldest) = self.oldest_day().await? else {
                return Ok(());
            };
            self.logger
                .info()
                .source("storage")
                .msg(format!("purging {}", oldest.display()))
                .await;
            tokio::fs::remove_dir_all(&oldest).await?;
            prune_empty_parents(&self.recordings_dir, &oldest).await;
        }
        Ok(())
    }

    /// Oldest `YYYY/MM/DD` directory, by lexical order of its components.
    async fn oldest_day(&self) -> Result<Option<PathBuf>> {
        let Some(year) = first_dir(&self.recordings_dir).await? else {
            return Ok(None);
        };
        let Some(month) = first_dir(&year).await? else {
            return Ok(Some(year));
        };
        let Some(day) = first_dir(&month).await? else {
            return Ok(Some(month));
        };
        Ok(Some(day))
    }
}

async fn first_dir(dir: &std::path::Path) -> Result<Option<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs.into_iter().next())
}

async fn prune_empty_parents(root: &std::path::Path, removed: &std::path::Path) {
    let mut dir = removed.parent();
    while let Some(current) = dir {
        if current == root {
            break;
        }
        if tokio::fs::remove_dir(current).await.is_err() {
            break; // not empty
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn logger() -> Arc<Logger> {
        Arc::new(Logger::new(CancellationToken::new(), &[]))
    }

    #[test]
    fn test_valid_recording_id() {
        assert!(valid_recording_id("2025-12-28_23-15-12_m1"));
        assert!(valid_recording_id("2025-12-28_23-15-12_Front_Door"));
        assert!(!valid_recording_id("2025-12-28_23-15-12_"));
        assert!(!valid_recording_id("bad"));
        assert!(!valid_recording_id("2025-12-28_23-15-12_with.dot"));
        assert!(!valid_recording_id(
            "2025-12-28_23-15-12_morethan24charactersinthisid"
        ));
    }

    #[test]
    fn test_stem_path() {
        let base = stem_path(std::path::Path::new("/rec"), "2025-12-28_23-15-12_m1").unwrap();
        assert_eq!(
            base,
            PathBuf::from("/rec/2025/12/28/m1/2025-12-28_23-15-12_m1")
        );
        assert!(stem_path(std::path::Path::new("/rec"), "nope").is_none());
    }

    fn write_recording(dir: &std::path::Path, id: &str) {
        let base = stem_path(dir, id).unwrap();
        std::fs::create_dir_all(base.parent().unwrap()).unwrap();
        for ext in RECORDING_EXTENSIONS {
            std::fs::write(base.with_extension(ext), b"x").unwrap();
        }
    }

    #[tokio::test]
    async fn test_delete_recording_removes_all_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(tmp.path().to_path_buf(), u64::MAX, logger());
        let id = "2025-12-28_23-15-12_m1";
        write_recording(tmp.path(), id);

        manager.delete_recording(id).await.unwrap();
        let base = stem_path(tmp.path(), id).unwrap();
        for ext in RECORDING_EXTENSIONS {
            assert!(!base.with_extension(ext).exists());
        }

        let err = manager.delete_recording(id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_purge_removes_oldest_day_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_recording(tmp.path(), "2025-12-27_10-00-00_m1");
        write_recording(tmp.path(), "2025-12-28_10-00-00_m1");

        // 8 bytes on disk, 5 allowed: only the oldest day goes.
        let manager = StorageManager::new(tmp.path().to_path_buf(), 5, logger());
        manager.purge().await.unwrap();
        assert!(!tmp.path().join("2025/12/27").exists());
        assert!(tmp.path().join("2025/12/28/m1").exists());

        // Zero budget: everything goes.
        let manager = StorageManager::new(tmp.path().to_path_buf(), 0, logger());
        manager.purge().await.unwrap();
        assert!(!tmp.path().join("2025/12/28").exists());
    }
}
