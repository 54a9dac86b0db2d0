//! Monitor configuration
//!
//! One JSON file per monitor under `<configDir>/monitors/<id>.json`.
//! Mutations go through the manager's set operation, which implies a
//! restart of the running monitor.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::motion::MotionConfig;

static MONITOR_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,24}$").expect("static regex"));

pub fn valid_monitor_id(id: &str) -> bool {
    MONITOR_ID_RE.is_match(id)
}

/// Persisted configuration of one monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Slug, 1-24 chars of `[A-Za-z0-9_]`.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub audio_enabled: bool,
    /// Camera URL of the high-resolution stream.
    pub main_input: String,
    /// Optional low-resolution variant, re-streamed as `<id>_sub`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_input: Option<String>,
    #[serde(default)]
    pub hwaccel: String,
    /// Encoder argument template, e.g. "-c:v copy".
    #[serde(default)]
    pub video_encoder: String,
    #[serde(default)]
    pub audio_encoder: String,
    #[serde(default)]
    pub always_record: bool,
    /// Maximum recording duration, minutes.
    #[serde(default = "default_video_length")]
    pub video_length: f64,
    /// Nanoseconds subtracted from computed recording start times.
    #[serde(default)]
    pub timestamp_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_detection: Option<MotionConfig>,
    /// full, half, third, quarter, sixth or eighth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_scale: Option<String>,
}

fn default_video_length() -> f64 {
    15.0
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if !valid_monitor_id(&self.id) {
            return Err(Error::Validation(format!("invalid monitor id: {:?}", self.id)));
        }
        if self.main_input.is_empty() {
            return Err(Error::Validation("mainInput is required".to_string()));
        }
        if self.video_length <= 0.0 {
            return Err(Error::Validation(format!(
                "videoLength must be positive: {}",
                self.video_length
            )));
        }
        Ok(())
    }

    pub fn video_length_duration(&self) -> Duration {
        Duration::from_secs_f64(self.video_length * 60.0)
    }

    pub fn timestamp_offset_duration(&self) -> chrono::Duration {
        chrono::Duration::nanoseconds(self.timestamp_offset)
    }
}

/// Censored view exposed by `monitorsInfo`: no input URLs, which may embed
/// credentials.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorInfo {
    pub id: String,
    pub name: String,
    pub enable: bool,
    pub audio_enabled: bool,
    pub has_sub_stream: bool,
    pub running: bool,
}
