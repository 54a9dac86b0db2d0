//! Recorder data types
//!
//! Sidecar timestamps are RFC 3339 with nanosecond precision, always UTC
//! `Z`; event durations are integer nanoseconds.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Region of a detection, in percent coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// `[top, left, bottom, right]`, each 0-100.
    pub rect: [i32; 4],
}

/// One detection attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// 0-100.
    pub score: u8,
    pub region: Region,
}

/// A timed interval that causes the recorder to be active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "rfc3339_nanos")]
    pub time: DateTime<Utc>,
    /// Nanoseconds.
    #[serde(with = "duration_nanos")]
    pub duration: chrono::Duration,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Event {
    /// End of the interval this event covers.
    pub fn end(&self) -> DateTime<Utc> {
        self.time + self.duration
    }
}

/// Sidecar contents of one recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingData {
    #[serde(with = "rfc3339_nanos")]
    pub start: DateTime<Utc>,
    #[serde(with = "rfc3339_nanos")]
    pub end: DateTime<Utc>,
    pub events: Vec<Event>,
}

/// Container index of one recording (`.meta`): where each appended segment
/// lives inside `.mdat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerIndex {
    pub segments: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub offset: u64,
    pub size: u64,
    pub duration_ms: u64,
}

mod rfc3339_nanos {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &chrono::Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_nanoseconds().unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<chrono::Duration, D::Error> {
        let ns = i64::deserialize(d)?;
        Ok(chrono::Duration::nanoseconds(ns))
    }
}
