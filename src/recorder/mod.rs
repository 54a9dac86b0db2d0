//! Recorder
//!
//! ## Responsibilities
//!
//! - Turn the continuous stream into discrete, event-triggered recordings
//! - Compute the recording start from the pre-event HLS buffer
//! - Write media payload, container index, thumbnail and sidecar metadata
//!
//! State machine: `idle → prepare → starting → recording → finalize → idle`.
//! Event triggers arrive on a single channel, serializing detector and
//! external sources. A recording that reaches `videoLength` is finalized
//! and, when an event is still active, the recorder re-enters `prepare` so
//! the continuation opens a new stem on the next keyframe.

pub mod types;

pub use types::{ContainerIndex, Detection, Event, IndexEntry, RecordingData, Region};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hls::HlsMuxer;
use crate::log_bus::Logger;
use crate::process::{PipeLevel, Process};

/// Segments of pre-event buffer included in the recording start.
const PRE_RECORD_SEGMENTS: usize = 2;

/// Extension points supplied by the monitor manager.
#[derive(Clone, Default)]
pub struct RecorderHooks {
    /// Mutates the thumbnail encoder args before spawn.
    pub on_rec_save: Option<Arc<dyn Fn(&str, &mut Vec<String>) + Send + Sync>>,
    /// Runs after a recording is finalized.
    pub on_rec_saved: Option<Arc<dyn Fn(&Path, &RecordingData) + Send + Sync>>,
}

/// Per-monitor recorder.
pub struct Recorder {
    pub monitor_id: String,
    pub always_record: bool,
    pub video_length: Duration,
    pub timestamp_offset: chrono::Duration,
    pub recordings_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub hls: Arc<HlsMuxer>,
    pub logger: Arc<Logger>,
    pub hooks: RecorderHooks,
}

impl Recorder {
    /// Spawn `run` as a background task.
    pub fn run_in_background(
        self: Arc<Self>,
        token: CancellationToken,
        trigger_rx: mpsc::Receiver<Event>,
    ) {
        tokio::spawn(self.run(token, trigger_rx));
    }

    /// Run until cancellation. `trigger_rx` is the single serialized event
    /// input shared by the detector and external callers.
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        mut trigger_rx: mpsc::Receiver<Event>,
    ) {
        let mut pending: Vec<Event> = Vec::new();

        loop {
            // idle
            let events = if !pending.is_empty() {
                std::mem::take(&mut pending)
            } else if self.always_record {
                vec![Event {
                    time: Utc::now(),
                    duration: chrono::Duration::from_std(self.video_length)
                        .unwrap_or(chrono::Duration::MAX),
                    detections: Vec::new(),
                }]
            } else {
                let event = tokio::select! {
                    _ = token.cancelled() => return,
                    event = trigger_rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };
                if event.end() <= Utc::now() {
                    continue;
                }
                vec![event]
            };

            // prepare
            let Some(pre_buffer) = self.prepare(&token).await else {
                if token.is_cancelled() {
                    return;
                }
                continue;
            };
            let start_time = Utc::now()
                - chrono::Duration::from_std(pre_buffer).unwrap_or_default()
                - self.timestamp_offset;

            match self
                .record(&token, &mut trigger_rx, events, start_time)
                .await
            {
                Ok(leftover) => {
                    if !self.always_record {
                        pending = leftover;
                    }
                }
                Err(e) => {
                    self.logger
                        .error()
                        .source("recorder")
                        .monitor(&self.monitor_id)
                        .msg(format!("recording failed: {e}"))
                        .await;
                }
            }

            if token.is_cancelled() {
                return;
            }
        }
    }

    /// Wait for a keyframe with enough buffered segments behind it; returns
    /// the pre-event buffer duration. None means give up (cancelled or no
    /// keyframes at all).
    async fn prepare(&self, token: &CancellationToken) -> Option<Duration> {
        loop {
            match self.hls.wait_for_keyframe(token, PRE_RECORD_SEGMENTS).await {
                Ok(duration) => {
                    if token.is_cancelled() {
                        return None;
                    }
                    return Some(duration);
                }
                Err(Error::KeyframeTimeout) => {
                    self.logger
                        .warn()
                        .source("recorder")
                        .monitor(&self.monitor_id)
                        .msg("no keyframe within deadline")
                        .await;
                    return None;
                }
                // Playlist not deep enough yet; keep waiting.
                Err(_) => {
                    if token.is_cancelled() {
                        return None;
                    }
                }
            }
        }
    }

    /// The `starting → recording → finalize` leg. Returns events still
    /// active at finalization (the continuation re-records them).
    async fn record(
        &self,
        token: &CancellationToken,
        trigger_rx: &mut mpsc::Receiver<Event>,
        mut events: Vec<Event>,
        start_time: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut segment_rx = self.hls.subscribe_segments();

        // starting: create the file set.
        let local_start = start_time.with_timezone(&Local);
        let stem = format!(
            "{}_{}",
            local_start.format("%Y-%m-%d_%H-%M-%S"),
            self.monitor_id
        );
        let dir = self
            .recordings_dir
            .join(local_start.format("%Y/%m/%d").to_string())
            .join(&self.monitor_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Resource(format!("create {}: {e}", dir.display())))?;
        let base = dir.join(&stem);

        let mdat_path = base.with_extension("mdat");
        let mut mdat = tokio::fs::File::create(&mdat_path).await?;

        self.logger
            .info()
            .source("recorder")
            .monitor(&self.monitor_id)
            .msg(format!("recording started: {stem}"))
            .await;

        let mut index = ContainerIndex::default();
        let mut offset: u64 = 0;
        let mut recording_end = events
            .iter()
            .map(Event::end)
            .max()
            .unwrap_or_else(Utc::now);
        let started_at = tokio::time::Instant::now();
        let mut thumbnail_written = false;
        let mut write_failed = false;

        // recording
        loop {
            let until_end = (recording_end - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let until_split = self.video_length.saturating_sub(started_at.elapsed());

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(until_split) => break,
                _ = tokio::time::sleep(until_end), if !self.always_record => {
                    if Utc::now() >= recording_end {
                        break;
                    }
                }
                event = trigger_rx.recv() => {
                    let Some(event) = event else { break };
                    if event.end() > recording_end {
                        recording_end = event.end();
                    }
                    events.push(event);
                }
                segment = segment_rx.recv() => {
                    let segment = match segment {
                        Ok(segment) => segment,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    if !thumbnail_written {
                        thumbnail_written = true;
                        self.write_thumbnail(token, &segment.path, &base).await;
                    }
                    if let Err(e) = mdat.write_all(&segment.data).await {
                        self.logger
                            .error()
                            .source("recorder")
                            .monitor(&self.monitor_id)
                            .msg(format!("media write: {e}"))
                            .await;
                        write_failed = true;
                        break;
                    }
                    index.segments.push(IndexEntry {
                        offset,
                        size: segment.data.len() as u64,
                        duration_ms: segment.duration.as_millis() as u64,
                    });
                    offset += segment.data.len() as u64;
                }
            }
        }

        // finalize: close media, then index, then sidecar (atomic).
        let end_time = Utc::now();
        let _ = mdat.flush().await;
        drop(mdat);

        let meta = serde_json::to_vec_pretty(&index)?;
        tokio::fs::write(base.with_extension("meta"), meta).await?;

        let data = RecordingData {
            start: start_time,
            end: end_time,
            events: events.clone(),
        };
        let sidecar = serde_json::to_vec_pretty(&data)?;
        let tmp = base.with_extension("json.tmp");
        tokio::fs::write(&tmp, sidecar).await?;
        tokio::fs::rename(&tmp, base.with_extension("json")).await?;

        if let Some(hook) = &self.hooks.on_rec_saved {
            hook(&base, &data);
        }

        self.logger
            .info()
            .source("recorder")
            .monitor(&self.monitor_id)
            .msg(format!("recording finished: {stem}"))
            .await;

        if write_failed {
            return Err(Error::Process("media writer failed".to_string()));
        }
        Ok(events
            .into_iter()
            .filter(|event| event.end() > end_time)
            .collect())
    }

    /// Extract one frame of the first segment as the thumbnail. Failure is
    /// logged, never fatal to the recording.
    async fn write_thumbnail(&self, token: &CancellationToken, segment: &Path, base: &Path) {
        let jpeg = base.with_extension("jpeg");
        let mut args: Vec<String> = vec![
            "-n".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            segment.display().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            jpeg.display().to_string(),
        ];
        if let Some(hook) = &self.hooks.on_rec_save {
            hook(&self.monitor_id, &mut args);
        }

        let process = Process::new(&self.ffmpeg_bin, &args)
            .prefix(format!("{}: thumbnail: ", self.monitor_id))
            .monitor(&self.monitor_id)
            .pipe_level(PipeLevel::Error)
            .logger(self.logger.clone());
        let logger = self.logger.clone();
        let monitor_id = self.monitor_id.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            if let Err(e) = process.start(token).await {
                logger
                    .warn()
                    .source("recorder")
                    .monitor(&monitor_id)
                    .msg(format!("thumbnail: {e}"))
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtsp::AccessUnit;

    fn au(pts_ms: u64) -> AccessUnit {
        AccessUnit {
            data: vec![0, 0, 0, 1, 0x65, 0xaa],
            keyframe: true,
            pts: Duration::from_millis(pts_ms),
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        trigger_tx: mpsc::Sender<Event>,
        token: CancellationToken,
        feeder: CancellationToken,
        recordings_dir: PathBuf,
    }

    async fn fixture(always_record: bool, video_length: Duration) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let hls = HlsMuxer::new(tmp.path().join("hls")).await.unwrap();
        let recordings_dir = tmp.path().join("recordings");
        let logger = Arc::new(Logger::new(CancellationToken::new(), &[]));

        let recorder = Arc::new(Recorder {
            monitor_id: "m1".to_string(),
            always_record,
            video_length,
            timestamp_offset: chrono::Duration::zero(),
            recordings_dir: recordings_dir.clone(),
            ffmpeg_bin: "/bin/true".to_string(),
            hls: hls.clone(),
            logger,
            hooks: RecorderHooks::default(),
        });

        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        recorder.run_in_background(token.clone(), trigger_rx);

        // Keep cutting segments so prepare and record always make progress.
        let feeder = CancellationToken::new();
        let feeder_guard = feeder.clone();
        tokio::spawn(async move {
            let mut pts: u64 = 0;
            loop {
                if feeder_guard.is_cancelled() {
                    return;
                }
                hls.feed(&au(pts)).await.unwrap();
                pts += 4000;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        });

        Fixture {
            _tmp: tmp,
            trigger_tx,
            token,
            feeder,
            recordings_dir,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.feeder.cancel();
            self.token.cancel();
        }
    }

    fn find_sidecars(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    out.push(path);
                }
            }
        }
        out.sort();
        out
    }

    async fn wait_for_sidecar(dir: &Path, count: usize) -> Vec<PathBuf> {
        for _ in 0..400 {
            let found = find_sidecars(dir);
            if found.len() >= count {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no sidecar appeared under {}", dir.display());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_event_one_recording() {
        let fixture = fixture(false, Duration::from_secs(3600)).await;

        let event = Event {
            time: Utc::now(),
            duration: chrono::Duration::milliseconds(600),
            detections: vec![Detection {
                label: "person".to_string(),
                score: 70,
                region: Region { rect: [0, 0, 50, 50] },
            }],
        };
        fixture.trigger_tx.send(event.clone()).await.unwrap();

        let sidecars = wait_for_sidecar(&fixture.recordings_dir, 1).await;
        let data: RecordingData =
            serde_json::from_slice(&std::fs::read(&sidecars[0]).unwrap()).unwrap();
        assert_eq!(data.events.len(), 1);
        assert_eq!(data.events[0].detections[0].label, "person");
        assert!(data.start <= data.end);

        // Sibling media and index files exist and are closed.
        let base = sidecars[0].with_extension("");
        let mdat = std::fs::read(base.with_extension("mdat")).unwrap();
        assert!(!mdat.is_empty());
        let index: ContainerIndex =
            serde_json::from_slice(&std::fs::read(base.with_extension("meta")).unwrap()).unwrap();
        assert!(!index.segments.is_empty());
        let last = index.segments.last().unwrap();
        assert_eq!(last.offset + last.size, mdat.len() as u64);

        // Stem matches the recording id format.
        let stem = base.file_name().unwrap().to_str().unwrap();
        let re = regex::Regex::new(
            r"^\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}_[A-Za-z0-9_]{1,24}$",
        )
        .unwrap();
        assert!(re.is_match(stem), "bad stem: {stem}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_overlapping_events_coalesce() {
        let fixture = fixture(false, Duration::from_secs(3600)).await;

        let first = Event {
            time: Utc::now(),
            duration: chrono::Duration::milliseconds(500),
            detections: Vec::new(),
        };
        fixture.trigger_tx.send(first.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let second = Event {
            time: Utc::now(),
            duration: chrono::Duration::milliseconds(700),
            detections: Vec::new(),
        };
        fixture.trigger_tx.send(second.clone()).await.unwrap();

        let sidecars = wait_for_sidecar(&fixture.recordings_dir, 1).await;
        assert_eq!(sidecars.len(), 1, "events must coalesce into one recording");
        let data: RecordingData =
            serde_json::from_slice(&std::fs::read(&sidecars[0]).unwrap()).unwrap();
        assert_eq!(data.events.len(), 2);
        assert_eq!(data.events[0].time, first.time);
        assert_eq!(data.events[1].time, second.time);
        assert!(data.end >= second.end());
        // Both events wholly inside the recording interval.
        for event in &data.events {
            assert!(event.time >= data.start);
            assert!(event.end() <= data.end);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_mid_recording_finalizes() {
        let fixture = fixture(false, Duration::from_secs(3600)).await;

        fixture
            .trigger_tx
            .send(Event {
                time: Utc::now(),
                duration: chrono::Duration::seconds(3600),
                detections: Vec::new(),
            })
            .await
            .unwrap();

        // Wait until media is being written, then stop the monitor.
        tokio::time::sleep(Duration::from_millis(400)).await;
        fixture.token.cancel();

        let sidecars = wait_for_sidecar(&fixture.recordings_dir, 1).await;
        let data: RecordingData =
            serde_json::from_slice(&std::fs::read(&sidecars[0]).unwrap()).unwrap();
        assert!(data.start <= data.end);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_always_record_splits_at_video_length() {
        // Longer than a second so consecutive stems never share a
        // second-resolution timestamp.
        let fixture = fixture(true, Duration::from_millis(1200)).await;

        // Two consecutive recordings with distinct stems appear without any
        // trigger.
        let sidecars = wait_for_sidecar(&fixture.recordings_dir, 2).await;
        assert!(sidecars.len() >= 2);
        assert_ne!(sidecars[0], sidecars[1]);
    }
}
