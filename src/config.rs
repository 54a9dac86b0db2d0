//! Environment configuration
//!
//! All runtime paths and ports come from environment variables with
//! defaults. `prepare_environment` creates the directory tree before any
//! subsystem starts.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Process-wide configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Web/API port
    pub port: u16,
    /// RTSP server port (loopback trust model)
    pub rtsp_port: u16,
    /// Persistent config directory (monitors/, groups/)
    pub config_dir: PathBuf,
    /// Storage directory (recordings/, logs/)
    pub storage_dir: PathBuf,
    /// Shared-memory directory (hls/, motion/), expected to be tmpfs
    pub shm_dir: PathBuf,
    /// ffmpeg binary
    pub ffmpeg_bin: String,
    /// Soft disk quota for recordings, in gigabytes
    pub disk_space_gb: u64,
    /// Fraction of the quota granted to the log store, in percent
    pub log_db_share_pct: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: std::env::var("NVRD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(2020),
            rtsp_port: std::env::var("NVRD_RTSP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(2021),
            config_dir: std::env::var("NVRD_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/nvrd/configs")),
            storage_dir: std::env::var("NVRD_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/nvrd/storage")),
            shm_dir: std::env::var("NVRD_SHM_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/dev/shm/nvrd")),
            ffmpeg_bin: std::env::var("NVRD_FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            disk_space_gb: std::env::var("NVRD_DISK_SPACE_GB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            log_db_share_pct: std::env::var("NVRD_LOG_DB_SHARE_PCT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        }
    }
}

impl EnvConfig {
    pub fn monitors_dir(&self) -> PathBuf {
        self.config_dir.join("monitors")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.config_dir.join("groups")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.storage_dir.join("recordings")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.storage_dir.join("logs")
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.shm_dir.join("hls")
    }

    pub fn motion_dir(&self) -> PathBuf {
        self.shm_dir.join("motion")
    }

    /// Create every directory the subsystems expect to exist.
    pub fn prepare_environment(&self) -> Result<()> {
        for dir in [
            self.monitors_dir(),
            self.groups_dir(),
            self.recordings_dir(),
            self.logs_dir(),
            self.hls_dir(),
            self.motion_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Log store disk budget in bytes.
    pub fn log_disk_budget(&self) -> u64 {
        self.disk_space_gb * 1_000_000_000 / 100 * self.log_db_share_pct
    }
}

/// Total size of all regular files under `dir`, recursively.
pub fn dir_size(dir: &Path) -> u64 {
    let mut total = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
