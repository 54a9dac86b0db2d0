//! Recording query crawler
//!
//! Walks the `recordings/YYYY/MM/DD/<monitor>/` tree, newest-first by
//! default, paginating on a recording-id cursor. Sidecar data is inlined on
//! request; recordings whose sidecar is missing (crash before finalize) are
//! returned without data.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::recorder::RecordingData;
use crate::storage::valid_recording_id;

/// Query parameters; shapes the REST layer's `/api/recording/query`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    /// Exclusive id cursor; results strictly older (or newer with
    /// `reverse`) than this recording id.
    #[serde(default)]
    pub time: Option<String>,
    /// Oldest-first instead of newest-first.
    #[serde(default)]
    pub reverse: Option<bool>,
    /// Comma-separated monitor ids; empty matches all.
    #[serde(default)]
    pub monitors: Option<String>,
    /// Inline sidecar contents.
    #[serde(default)]
    pub data: Option<bool>,
}

/// One query result.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<RecordingData>,
}

/// Run a query against the recordings tree.
pub async fn query_recordings(
    recordings_dir: &Path,
    query: &RecordingQuery,
) -> Result<Vec<RecordingEntry>> {
    let limit = query.limit.unwrap_or(100);
    let reverse = query.reverse.unwrap_or(false);
    let monitors: Vec<String> = query
        .monitors
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|m| !m.is_empty())
        .map(|m| m.to_string())
        .collect();
    let include_data = query.data.unwrap_or(false);

    // The stem's leading timestamp makes lexical order chronological.
    let mut ids = collect_ids(recordings_dir);
    ids.sort();
    if !reverse {
        ids.reverse();
    }

    let mut out = Vec::new();
    for (id, base) in ids {
        if out.len() >= limit {
            break;
        }
        if let Some(cursor) = &query.time {
            let passes = if reverse { id > *cursor } else { id < *cursor };
            if !passes {
                continue;
            }
        }
        if !monitors.is_empty() {
            let monitor = &id[20..];
            if !monitors.iter().any(|m| m == monitor) {
                continue;
            }
        }

        let data = if include_data {
            read_sidecar(&base).await
        } else {
            None
        };
        out.push(RecordingEntry { id, data });
    }
    Ok(out)
}

async fn read_sidecar(base: &Path) -> Option<RecordingData> {
    let raw = tokio::fs::read(base.with_extension("json")).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// All recording ids with their stem paths. A recording is identified by
/// its `.mdat`, so partially-written recordings are visible too.
fn collect_ids(recordings_dir: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    let mut stack = vec![recordings_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("mdat") {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if valid_recording_id(stem) {
                    out.push((stem.to_string(), path.with_extension("")));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::stem_path;
    use chrono::{TimeZone, Utc};

    fn write_recording(dir: &Path, id: &str, with_sidecar: bool) {
        let base = stem_path(dir, id).unwrap();
        std::fs::create_dir_all(base.parent().unwrap()).unwrap();
        std::fs::write(base.with_extension("mdat"), b"media").unwrap();
        if with_sidecar {
            let data = RecordingData {
                start: Utc.with_ymd_and_hms(2025, 12, 28, 10, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2025, 12, 28, 10, 1, 0).unwrap(),
                events: Vec::new(),
            };
            std::fs::write(
                base.with_extension("json"),
                serde_json::to_vec(&data).unwrap(),
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_newest_first_and_reverse() {
        let tmp = tempfile::tempdir().unwrap();
        write_recording(tmp.path(), "2025-12-27_10-00-00_m1", true);
        write_recording(tmp.path(), "2025-12-28_10-00-00_m1", true);
        write_recording(tmp.path(), "2025-12-28_12-00-00_m2", true);

        let entries = query_recordings(tmp.path(), &RecordingQuery::default())
            .await
            .unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "2025-12-28_12-00-00_m2",
                "2025-12-28_10-00-00_m1",
                "2025-12-27_10-00-00_m1",
            ]
        );

        let entries = query_recordings(
            tmp.path(),
            &RecordingQuery {
                reverse: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(entries[0].id, "2025-12-27_10-00-00_m1");
    }

    #[tokio::test]
    async fn test_query_cursor_and_monitor_filter() {
        let tmp = tempfile::tempdir().unwrap();
        write_recording(tmp.path(), "2025-12-27_10-00-00_m1", true);
        write_recording(tmp.path(), "2025-12-28_10-00-00_m1", true);
        write_recording(tmp.path(), "2025-12-28_12-00-00_m2", true);

        let entries = query_recordings(
            tmp.path(),
            &RecordingQuery {
                time: Some("2025-12-28_10-00-00_m1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["2025-12-27_10-00-00_m1"]);

        let entries = query_recordings(
            tmp.path(),
            &RecordingQuery {
                monitors: Some("m2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["2025-12-28_12-00-00_m2"]);
    }

    #[tokio::test]
    async fn test_query_inlines_data_and_skips_missing_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        write_recording(tmp.path(), "2025-12-28_10-00-00_m1", true);
        write_recording(tmp.path(), "2025-12-28_11-00-00_m1", false); // partial

        let entries = query_recordings(
            tmp.path(),
            &RecordingQuery {
                data: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(entries.len(), 2);
        // Partial recording is visible but carries no data.
        assert_eq!(entries[0].id, "2025-12-28_11-00-00_m1");
        assert!(entries[0].data.is_none());
        assert!(entries[1].data.is_some());
    }

    #[tokio::test]
    async fn test_query_limit() {
        let tmp = tempfile::tempdir().unwrap();
        for hour in 10..20 {
            write_recording(tmp.path(), &format!("2025-12-28_{hour}-00-00_m1"), true);
        }
        let entries = query_recordings(
            tmp.path(),
            &RecordingQuery {
                limit: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, "2025-12-28_19-00-00_m1");
    }
}
