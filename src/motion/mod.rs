//! Motion detector
//!
//! ## Responsibilities
//!
//! - Generate per-zone alpha masks from the monitor's zone polygons
//! - Run a decoder subprocess reading the main encoder's fifo tee
//! - Parse per-frame scene scores from its stderr and raise triggers
//!
//! The decoder overlays each mask on a downscaled, rate-limited copy of the
//! main stream and prints `lavfi.scene_score` metadata per zone. A score
//! above the zone threshold emits an event ending `duration` seconds from
//! now into the recorder's trigger channel. The detector restarts with 1 s
//! back-off on crash.

pub mod mask;

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::log_bus::Logger;
use crate::process::{make_pipe, parse_args, PipeLevel, Process};
use crate::recorder::Event;
use mask::{create_mask, save_mask, to_abs};

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Per-monitor motion detection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MotionConfig {
    /// Frames per second fed to the detector.
    pub feed_rate: f64,
    /// full, half, third, quarter, sixth or eighth.
    #[serde(default)]
    pub frame_scale: String,
    /// Event duration in seconds.
    pub duration: u64,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

/// One detection zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub enable: bool,
    /// Scene-score percentage above which a trigger fires.
    pub threshold: f64,
    /// Polygon in percent coordinates, `[[x, y], ...]`.
    pub area: Vec<[i64; 2]>,
}

/// Map a scale name to its divisor.
pub fn parse_scale(scale: &str) -> u32 {
    match scale.to_lowercase().as_str() {
        "half" => 2,
        "third" => 3,
        "quarter" => 4,
        "sixth" => 6,
        "eighth" => 8,
        _ => 1,
    }
}

/// The monitor's fifo for this detector: `<shm>/motion/<id>/main.fifo`.
pub fn main_pipe(motion_dir: &Path, monitor_id: &str) -> PathBuf {
    motion_dir.join(monitor_id).join("main.fifo")
}

/// Appended to the main encoder args by the start-process hook: tee a copy
/// of the video into the detector fifo.
pub fn append_tee_args(args: &mut Vec<String>, pipe: &Path) {
    args.extend(parse_args(
        "-c:v copy -map 0:v -f fifo -fifo_format mpegts \
         -drop_pkts_on_overflow 1 -attempt_recovery 1 \
         -restart_with_keyframe 1 -recovery_wait_time 1",
    ));
    args.push(pipe.display().to_string());
}

/// Build the decoder command line for the given mask files.
pub fn detector_args(
    pipe: &Path,
    masks: &[PathBuf],
    hwaccel: &str,
    feed_rate: f64,
    scale: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".to_string()];
    if !hwaccel.is_empty() {
        args.extend(parse_args(&format!("-hwaccel {hwaccel}")));
    }
    args.push("-i".to_string());
    args.push(pipe.display().to_string());
    for mask in masks {
        args.push("-i".to_string());
        args.push(mask.display().to_string());
    }

    let mut filter = format!(
        "[0:v]fps=fps={feed_rate},scale=iw/{scale}:ih/{scale},split={}",
        masks.len()
    );
    for i in 0..masks.len() {
        filter.push_str(&format!("[in{i}]"));
    }
    for i in 0..masks.len() {
        filter.push_str(&format!(
            ";[in{i}][{}:v]overlay,metadata=add:key=id:value={i},\
             select='gte(scene\\,0)',metadata=print[out{i}]",
            i + 1
        ));
    }
    args.push("-filter_complex".to_string());
    args.push(filter);

    for i in 0..masks.len() {
        args.push("-map".to_string());
        args.push(format!("[out{i}]"));
        args.push("-f".to_string());
        args.push("null".to_string());
        args.push("-".to_string());
    }
    args
}

/// Stitches decoder stderr lines into score blocks.
///
/// ```text
/// [Parsed_metadata_5 @ 0x] frame:35   pts:39      pts_time:19.5
/// [Parsed_metadata_5 @ 0x] id=0
/// [Parsed_metadata_5 @ 0x] lavfi.scene_score=0.008761
/// ```
pub struct ScoreParser {
    segment: String,
}

impl ScoreParser {
    pub fn new() -> Self {
        Self {
            segment: String::new(),
        }
    }

    /// Feed one line; a completed block yields `(zone id, score percent)`.
    pub fn parse_line(&mut self, line: &str) -> Option<(usize, f64)> {
        self.segment.push('\n');
        self.segment.push_str(line);
        if !line.contains("lavfi.scene_score") {
            return None;
        }
        let segment = std::mem::replace(&mut self.segment, line.to_string());
        parse_segment(&segment)
    }
}

impl Default for ScoreParser {
    fn default() -> Self {
        Self::new()
    }
}

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bid=(\d+)\b\n.*lavfi.scene_score=(\d.\d+)").expect("static regex"));

fn parse_segment(segment: &str) -> Option<(usize, f64)> {
    let captures = SEGMENT_RE.captures(segment)?;
    let id: usize = captures.get(1)?.as_str().parse().ok()?;
    let score: f64 = captures.get(2)?.as_str().parse().ok()?;
    Some((id, score * 100.0))
}

/// The running detector pipeline of one monitor.
pub struct MotionDetector {
    pub monitor_id: String,
    pub config: MotionConfig,
    pub motion_dir: PathBuf,
    pub hwaccel: String,
    pub ffmpeg_bin: String,
    /// Frame size of the main stream, probed at monitor start.
    pub frame_size: (u32, u32),
    pub logger: Arc<Logger>,
    pub trigger_tx: mpsc::Sender<Event>,
}

impl MotionDetector {
    /// Prepare fifo and masks, then spawn the detector loop. A resource
    /// failure here fails the monitor start.
    pub fn start(self, token: CancellationToken) -> Result<()> {
        let zone_dir = self.motion_dir.join(&self.monitor_id);
        std::fs::create_dir_all(&zone_dir)
            .map_err(|e| Error::Resource(format!("create {}: {e}", zone_dir.display())))?;

        let pipe = main_pipe(&self.motion_dir, &self.monitor_id);
        make_pipe(&pipe)?;

        let scale = parse_scale(&self.config.frame_scale);
        let (w, h) = (self.frame_size.0 / scale, self.frame_size.1 / scale);

        let mut masks = Vec::new();
        let mut enabled_zones = Vec::new();
        for (i, zone) in self.config.zones.iter().enumerate() {
            if !zone.enable {
                continue;
            }
            let polygon = to_abs(&zone.area, w, h);
            let path = zone_dir.join(format!("zone{i}.png"));
            save_mask(&path, &create_mask(w, h, &polygon))?;
            masks.push(path);
            enabled_zones.push(zone.clone());
        }
        if masks.is_empty() {
            return Err(Error::Validation(format!(
                "{}: motion: no enabled zones",
                self.monitor_id
            )));
        }

        let args = detector_args(&pipe, &masks, &self.hwaccel, self.config.feed_rate, scale);
        tokio::spawn(self.run(token, args, enabled_zones));
        Ok(())
    }

    async fn run(self, token: CancellationToken, args: Vec<String>, zones: Vec<Zone>) {
        let duration = chrono::Duration::seconds(self.config.duration as i64);

        loop {
            if token.is_cancelled() {
                self.logger
                    .info()
                    .source("motion")
                    .monitor(&self.monitor_id)
                    .msg("detector stopped")
                    .await;
                return;
            }

            let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
            let zones = zones.clone();
            let logger = self.logger.clone();
            let monitor_id = self.monitor_id.clone();
            let trigger_tx = self.trigger_tx.clone();
            let parser_task = tokio::spawn(async move {
                let mut parser = ScoreParser::new();
                while let Some(line) = line_rx.recv().await {
                    let Some((id, score)) = parser.parse_line(&line) else {
                        continue;
                    };
                    let Some(zone) = zones.get(id) else { continue };
                    if score > zone.threshold {
                        logger
                            .info()
                            .source("motion")
                            .monitor(&monitor_id)
                            .msg(format!("trigger id:{id} score:{score:.2}"))
                            .await;
                        let _ = trigger_tx
                            .send(Event {
                                time: Utc::now(),
                                duration,
                                detections: Vec::new(),
                            })
                            .await;
                    }
                }
            });

            let process = Process::new(&self.ffmpeg_bin, &args)
                .prefix(format!("{}: motion: ", self.monitor_id))
                .monitor(&self.monitor_id)
                .pipe_level(PipeLevel::Quiet)
                .logger(self.logger.clone())
                .stderr_lines(line_tx);

            if let Err(e) = process.start(token.clone()).await {
                self.logger
                    .error()
                    .source("motion")
                    .monitor(&self.monitor_id)
                    .msg(format!("detector crashed: {e}"))
                    .await;
                tokio::time::sleep(RESTART_BACKOFF).await;
            }
            let _ = parser_task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scale() {
        assert_eq!(parse_scale("full"), 1);
        assert_eq!(parse_scale("Half"), 2);
        assert_eq!(parse_scale("third"), 3);
        assert_eq!(parse_scale("quarter"), 4);
        assert_eq!(parse_scale("sixth"), 6);
        assert_eq!(parse_scale("eighth"), 8);
        assert_eq!(parse_scale("unknown"), 1);
    }

    #[test]
    fn test_score_parser_threshold_scenario() {
        let mut parser = ScoreParser::new();
        assert_eq!(
            parser.parse_line("[Parsed_metadata_1 @ 0x] frame:10 pts_time:3.3"),
            None
        );
        assert_eq!(parser.parse_line("[Parsed_metadata_1 @ 0x] id=0"), None);
        let (id, score) = parser
            .parse_line("[Parsed_metadata_1 @ 0x] lavfi.scene_score=0.084000")
            .unwrap();
        assert_eq!(id, 0);
        assert!((score - 8.4).abs() < 1e-9);

        // Below-threshold score still parses; the caller compares.
        assert_eq!(parser.parse_line("[Parsed_metadata_1 @ 0x] frame:11"), None);
        assert_eq!(parser.parse_line("[Parsed_metadata_1 @ 0x] id=0"), None);
        let (_, score) = parser
            .parse_line("[Parsed_metadata_1 @ 0x] lavfi.scene_score=0.030000")
            .unwrap();
        assert!((score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_parser_consecutive_blocks() {
        let mut parser = ScoreParser::new();
        for block in 0..3 {
            parser.parse_line(&format!("[x] frame:{block}"));
            parser.parse_line(&format!("[x] id={block}"));
            let (id, _) = parser
                .parse_line("[x] lavfi.scene_score=0.500000")
                .unwrap();
            assert_eq!(id, block);
        }
    }

    #[test]
    fn test_detector_args_shape() {
        let pipe = PathBuf::from("/shm/motion/m1/main.fifo");
        let masks = vec![
            PathBuf::from("/shm/motion/m1/zone0.png"),
            PathBuf::from("/shm/motion/m1/zone1.png"),
        ];
        let args = detector_args(&pipe, &masks, "cuda", 3.0, 2);

        assert_eq!(args[0], "-y");
        assert_eq!(&args[1..3], &["-hwaccel", "cuda"]);
        assert!(args.contains(&"/shm/motion/m1/main.fifo".to_string()));
        assert!(args.contains(&"/shm/motion/m1/zone1.png".to_string()));

        let filter_index = args.iter().position(|a| a == "-filter_complex").unwrap();
        let filter = &args[filter_index + 1];
        assert!(filter.starts_with("[0:v]fps=fps=3,scale=iw/2:ih/2,split=2[in0][in1]"));
        assert!(filter.contains("metadata=add:key=id:value=0"));
        assert!(filter.contains("metadata=add:key=id:value=1"));
        assert!(filter.contains("[2:v]overlay"));

        // One null output per mask.
        assert_eq!(args.iter().filter(|a| *a == "null").count(), 2);
    }

    #[test]
    fn test_append_tee_args() {
        let mut args = vec!["-i".to_string(), "rtsp://cam".to_string()];
        append_tee_args(&mut args, Path::new("/shm/motion/m1/main.fifo"));
        assert!(args.contains(&"-fifo_format".to_string()));
        assert!(args.contains(&"mpegts".to_string()));
        assert_eq!(args.last().unwrap(), "/shm/motion/m1/main.fifo");
    }

    #[test]
    fn test_motion_config_json_field_names() {
        let json = r#"{
            "feedRate": 3.0,
            "frameScale": "half",
            "duration": 10,
            "zones": [{"enable": true, "threshold": 5.0, "area": [[0,0],[100,0],[100,100]]}]
        }"#;
        let config: MotionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.feed_rate, 3.0);
        assert_eq!(config.frame_scale, "half");
        assert_eq!(config.zones.len(), 1);
        assert!(config.zones[0].enable);
    }
}
