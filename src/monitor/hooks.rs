//! Hook set
//!
//! Extension points the manager runs at fixed places in the monitor
//! lifecycle. The set is assembled explicitly at startup and passed in;
//! there is no global registry, so tests compose their own. Hooks run
//! inline, sequentially, in registration order; a hook error is logged and
//! never aborts the pipeline.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::monitor::config::MonitorConfig;
use crate::monitor::Monitor;
use crate::motion::{self, MotionDetector};
use crate::process;
use crate::recorder::RecordingData;

pub type StartHook = Arc<dyn Fn(&Monitor) -> Result<()> + Send + Sync>;
pub type StartProcessHook = Arc<dyn Fn(&Monitor, &mut Vec<String>) + Send + Sync>;
pub type RecSaveHook = Arc<dyn Fn(&MonitorConfig, &mut Vec<String>) + Send + Sync>;
pub type RecSavedHook = Arc<dyn Fn(&Path, &RecordingData) + Send + Sync>;

/// All extension points, in registration order.
#[derive(Clone, Default)]
pub struct HookSet {
    /// Extra log-bus source names contributed by hooks.
    pub log_sources: Vec<&'static str>,
    /// Runs when a monitor has started.
    pub on_start: Vec<StartHook>,
    /// Mutates the main encoder args before spawn.
    pub on_start_process: Vec<StartProcessHook>,
    /// Mutates the thumbnail encoder args before spawn.
    pub on_rec_save: Vec<RecSaveHook>,
    /// Runs after a recording is finalized.
    pub on_rec_saved: Vec<RecSavedHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The motion-detection pipeline: tee the main stream into a fifo and
    /// run a scene-score decoder against the zone masks.
    pub fn register_motion(mut self) -> Self {
        self.on_start_process
            .push(Arc::new(|monitor: &Monitor, args: &mut Vec<String>| {
                if monitor.config.motion_detection.is_none() {
                    return;
                }
                let pipe = motion::main_pipe(&monitor.env.motion_dir(), &monitor.config.id);
                motion::append_tee_args(args, &pipe);
            }));

        self.on_start.push(Arc::new(motion_on_start));
        self
    }

    /// Downscale thumbnails by the configured factor.
    pub fn register_thumb_scale(mut self) -> Self {
        self.on_rec_save
            .push(Arc::new(|config: &MonitorConfig, args: &mut Vec<String>| {
                let scale = motion::parse_scale(config.thumb_scale.as_deref().unwrap_or("full"));
                if scale == 1 {
                    return;
                }
                // Inject the filter in front of the frame selector.
                if let Some(pos) = args.iter().position(|a| a == "-frames:v") {
                    args.insert(pos, format!("scale='iw/{scale}:ih/{scale}'"));
                    args.insert(pos, "-vf".to_string());
                }
            }));
        self
    }
}

/// Start hook of the motion pipeline: create the fifo, then probe the
/// camera and spawn the detector off the start path.
fn motion_on_start(monitor: &Monitor) -> Result<()> {
    let Some(motion_config) = monitor.config.motion_detection.clone() else {
        return Ok(());
    };

    // The fifo must exist before the main encoder first writes to it.
    let zone_dir = monitor.env.motion_dir().join(&monitor.config.id);
    std::fs::create_dir_all(&zone_dir).map_err(|e| {
        crate::error::Error::Resource(format!("create {}: {e}", zone_dir.display()))
    })?;
    process::make_pipe(&motion::main_pipe(
        &monitor.env.motion_dir(),
        &monitor.config.id,
    ))?;

    let monitor_id = monitor.config.id.clone();
    let main_input = monitor.config.main_input.clone();
    let hwaccel = monitor.config.hwaccel.clone();
    let motion_dir = monitor.env.motion_dir();
    let ffmpeg_bin = monitor.env.ffmpeg_bin.clone();
    let logger = monitor.logger.clone();
    let trigger_tx = monitor.trigger_tx.clone();
    let token = monitor.token.child_token();

    tokio::spawn(async move {
        let frame_size = match process::size_from_stream(&ffmpeg_bin, &main_input).await {
            Ok(size) => size,
            Err(e) => {
                logger
                    .error()
                    .source("motion")
                    .monitor(&monitor_id)
                    .msg(format!("could not probe frame size: {e}"))
                    .await;
                return;
            }
        };
        let detector = MotionDetector {
            monitor_id: monitor_id.clone(),
            config: motion_config,
            motion_dir,
            hwaccel,
            ffmpeg_bin,
            frame_size,
            logger: logger.clone(),
            trigger_tx,
        };
        if let Err(e) = detector.start(token) {
            logger
                .error()
                .source("motion")
                .monitor(&monitor_id)
                .msg(format!("could not start detector: {e}"))
                .await;
        }
    });
    Ok(())
}
