//! HLS muxer
//!
//! ## Responsibilities
//!
//! - Consume the re-published access units of one monitor stream
//! - Cut MPEG-TS segments on keyframes after the target duration
//! - Maintain the sliding-window playlist, pruning old segments
//! - Tell the recorder when keyframes land (`wait_for_keyframe`)
//!
//! Playlist updates are atomic: write to a temp file, then rename. At any
//! moment the playlist references only files present on disk.

pub mod playlist;
pub mod ts;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rtsp::AccessUnit;
use playlist::PlaylistSegment;
use ts::TsMuxer;

const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(4);
const DEFAULT_WINDOW: usize = 6;
const KEYFRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SEGMENT_FEED_LEN: usize = 16;

/// A finished segment, as seen by the recorder.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub index: u64,
    pub duration: Duration,
    pub path: PathBuf,
    /// Wall-clock time of the keyframe that opened the segment.
    pub keyframe_time: DateTime<Utc>,
    pub data: Arc<Vec<u8>>,
}

struct CurrentSegment {
    index: u64,
    data: Vec<u8>,
    start_pts: Duration,
    keyframe_time: DateTime<Utc>,
}

struct MuxState {
    muxer: TsMuxer,
    window: VecDeque<PlaylistSegment>,
    media_sequence: u64,
    next_index: u64,
    current: Option<CurrentSegment>,
}

/// Live HLS muxer for one monitor stream.
pub struct HlsMuxer {
    dir: PathBuf,
    target_duration: Duration,
    window_size: usize,
    state: Mutex<MuxState>,
    // Bumped on every playlist update; `wait_for_keyframe` watches it.
    manifest_tx: watch::Sender<u64>,
    segment_tx: broadcast::Sender<Arc<SegmentInfo>>,
}

impl HlsMuxer {
    /// Create the muxer writing into `dir` (created, then emptied of stale
    /// segments from a previous run).
    pub async fn new(dir: PathBuf) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }

        let (manifest_tx, _) = watch::channel(0);
        let (segment_tx, _) = broadcast::channel(SEGMENT_FEED_LEN);
        Ok(Arc::new(Self {
            dir,
            target_duration: DEFAULT_TARGET_DURATION,
            window_size: DEFAULT_WINDOW,
            state: Mutex::new(MuxState {
                muxer: TsMuxer::new(),
                window: VecDeque::new(),
                media_sequence: 0,
                next_index: 0,
                current: None,
            }),
            manifest_tx,
            segment_tx,
        }))
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join("stream.m3u8")
    }

    /// Subscribe to finished segments.
    pub fn subscribe_segments(&self) -> broadcast::Receiver<Arc<SegmentInfo>> {
        self.segment_tx.subscribe()
    }

    /// Consume the access-unit feed until cancellation.
    pub fn start(
        self: &Arc<Self>,
        token: CancellationToken,
        mut au_rx: broadcast::Receiver<Arc<AccessUnit>>,
    ) {
        let muxer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    au = au_rx.recv() => match au {
                        Ok(au) => {
                            if let Err(e) = muxer.feed(&au).await {
                                tracing::error!(error = %e, "hls: feed failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// Feed one access unit. Exposed for tests.
    pub async fn feed(&self, au: &AccessUnit) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(current) = &state.current else {
            // A segment only ever opens on a keyframe.
            if au.keyframe {
                open_segment(state, au);
            }
            return Ok(());
        };

        let elapsed = au.pts.saturating_sub(current.start_pts);
        if au.keyframe && elapsed >= self.target_duration {
            if let Some(finished) = state.current.take() {
                self.finish_segment(state, finished, au.pts).await?;
            }
            // The closing keyframe opens the next segment.
            open_segment(state, au);
        } else {
            let packets = state.muxer.write_au(&au.data, au.pts, au.keyframe);
            if let Some(current) = state.current.as_mut() {
                current.data.extend_from_slice(&packets);
            }
        }
        Ok(())
    }

    async fn finish_segment(
        &self,
        state: &mut MuxState,
        current: CurrentSegment,
        end_pts: Duration,
    ) -> Result<()> {
        let duration = end_pts.saturating_sub(current.start_pts);
        let filename = format!("{}.ts", current.index);
        let path = self.dir.join(&filename);
        let data = Arc::new(current.data);
        tokio::fs::write(&path, data.as_slice()).await?;

        state.window.push_back(PlaylistSegment {
            index: current.index,
            duration,
            filename,
        });

        // Prune the window and unlink segments that fell out of it.
        while state.window.len() > self.window_size {
            if let Some(old) = state.window.pop_front() {
                state.media_sequence += 1;
                let _ = tokio::fs::remove_file(self.dir.join(&old.filename)).await;
            }
        }

        let segments: Vec<PlaylistSegment> = state.window.iter().cloned().collect();
        let rendered = playlist::render(state.media_sequence, &segments);
        self.write_playlist_atomic(&rendered).await?;

        self.manifest_tx.send_modify(|generation| *generation += 1);
        let _ = self.segment_tx.send(Arc::new(SegmentInfo {
            index: current.index,
            duration,
            path,
            keyframe_time: current.keyframe_time,
            data,
        }));
        Ok(())
    }

    async fn write_playlist_atomic(&self, content: &str) -> Result<()> {
        let tmp = self.dir.join("stream.m3u8.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, self.playlist_path()).await?;
        Ok(())
    }

    /// Block until the playlist gains a segment, then return the combined
    /// duration of its last `n_segments` entries. Cancellation returns zero;
    /// 30 s without a new segment is a timeout error.
    pub async fn wait_for_keyframe(
        &self,
        token: &CancellationToken,
        n_segments: usize,
    ) -> Result<Duration> {
        let mut manifest_rx = self.manifest_tx.subscribe();
        tokio::select! {
            _ = token.cancelled() => Ok(Duration::ZERO),
            changed = tokio::time::timeout(KEYFRAME_WAIT_TIMEOUT, manifest_rx.changed()) => {
                match changed {
                    Err(_) => Err(Error::KeyframeTimeout),
                    Ok(Err(_)) => Err(Error::Internal("hls muxer gone".to_string())),
                    Ok(Ok(())) => {
                        let m3u8 = tokio::fs::read_to_string(self.playlist_path()).await?;
                        playlist::sum_last_durations(&m3u8, n_segments)
                    }
                }
            }
        }
    }
}

fn open_segment(state: &mut MuxState, au: &AccessUnit) {
    let index = state.next_index;
    state.next_index += 1;
    let mut data = state.muxer.segment_header();
    data.extend_from_slice(&state.muxer.write_au(&au.data, au.pts, true));
    state.current = Some(CurrentSegment {
        index,
        data,
        start_pts: au.pts,
        keyframe_time: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn au(pts_ms: u64, keyframe: bool) -> AccessUnit {
        AccessUnit {
            data: vec![0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }, 0xaa],
            keyframe,
            pts: Duration::from_millis(pts_ms),
        }
    }

    async fn muxer() -> (tempfile::TempDir, Arc<HlsMuxer>) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("hls").join("m1");
        let muxer = HlsMuxer::new(dir).await.unwrap();
        (tmp, muxer)
    }

    /// Feed 0..=seconds of 1 fps video with a keyframe every `gop` frames.
    async fn feed_seconds(muxer: &Arc<HlsMuxer>, seconds: u64, gop: u64) {
        for s in 0..=seconds {
            muxer.feed(&au(s * 1000, s % gop == 0)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_segments_cut_on_keyframes_after_target() {
        let (_tmp, muxer) = muxer().await;
        feed_seconds(&muxer, 8, 2).await;

        let m3u8 = tokio::fs::read_to_string(muxer.playlist_path())
            .await
            .unwrap();
        // Keyframes at 0,2,4,6,8s; target 4s => cuts at 4s and 8s.
        assert!(m3u8.contains("#EXTINF:4.000000,"));
        assert!(m3u8.contains("0.ts"));
        assert!(m3u8.contains("1.ts"));
        assert!(m3u8.contains("#EXT-X-VERSION:3"));
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:0"));
    }

    #[tokio::test]
    async fn test_playlist_references_only_files_on_disk() {
        let (_tmp, muxer) = muxer().await;
        // Enough segments to roll the window several times.
        feed_seconds(&muxer, 60, 2).await;

        let m3u8 = tokio::fs::read_to_string(muxer.playlist_path())
            .await
            .unwrap();
        let referenced: Vec<&str> = m3u8
            .lines()
            .filter(|l| l.ends_with(".ts"))
            .collect();
        assert!(referenced.len() <= DEFAULT_WINDOW);
        for filename in &referenced {
            let path = muxer.dir.join(filename);
            assert!(path.exists(), "{filename} referenced but missing");
        }
        // Media sequence advanced as segments fell out of the window.
        assert!(!m3u8.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
    }

    #[tokio::test]
    async fn test_segment_feed_carries_data_and_duration() {
        let (_tmp, muxer) = muxer().await;
        let mut segment_rx = muxer.subscribe_segments();

        feed_seconds(&muxer, 4, 2).await;

        let info = segment_rx.recv().await.unwrap();
        assert_eq!(info.index, 0);
        assert_eq!(info.duration, Duration::from_secs(4));
        assert!(!info.data.is_empty());
        assert_eq!(info.data.len() % 188, 0);
    }

    #[tokio::test]
    async fn test_wait_for_keyframe_returns_summed_durations() {
        let (_tmp, muxer) = muxer().await;
        let token = CancellationToken::new();

        let waiter = muxer.clone();
        let wait_token = token.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_for_keyframe(&wait_token, 1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        feed_seconds(&muxer, 4, 2).await;

        let duration = handle.await.unwrap().unwrap();
        assert_eq!(duration, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_wait_for_keyframe_cancellation_returns_zero() {
        let (_tmp, muxer) = muxer().await;
        let token = CancellationToken::new();
        token.cancel();
        let duration = muxer.wait_for_keyframe(&token, 2).await.unwrap();
        assert_eq!(duration, Duration::ZERO);
    }
}
