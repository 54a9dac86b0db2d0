//! Monitor runtime
//!
//! ## Responsibilities
//!
//! - Compose the per-monitor pipeline: encoder subprocesses, RTSP paths,
//!   HLS muxers, recorder and the optional motion detector
//! - Supervise the encoders with restart back-off
//!
//! A monitor runs at least four cooperating tasks (main encoder supervisor,
//! sub encoder supervisor when a sub stream exists, recorder loop, optional
//! detector loop). All of them share one cancellation token derived from
//! the manager; closing it is the sole stop signal. The task tracker is the
//! rendezvous `stop` waits on.

pub mod config;
pub mod hooks;
pub mod manager;

pub use config::{valid_monitor_id, MonitorConfig, MonitorInfo};
pub use hooks::HookSet;
pub use manager::MonitorManager;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::EnvConfig;
use crate::error::Result;
use crate::hls::HlsMuxer;
use crate::log_bus::Logger;
use crate::process::{parse_args, PipeLevel, Process};
use crate::recorder::{Event, Recorder, RecorderHooks};
use crate::rtsp::RtspServer;

const ENCODER_RESTART_BACKOFF: Duration = Duration::from_secs(1);
const TRIGGER_QUEUE_LEN: usize = 16;

/// One running monitor. Owned exclusively by the manager; destroyed on stop.
pub struct Monitor {
    pub config: Arc<MonitorConfig>,
    pub env: EnvConfig,
    pub logger: Arc<Logger>,
    pub hooks: Arc<HookSet>,
    /// Lifetime token of this run; a restart gets a fresh one.
    pub token: CancellationToken,
    /// Serialized event input shared by the detector and external triggers.
    pub trigger_tx: mpsc::Sender<Event>,
    tracker: TaskTracker,
}

impl Monitor {
    pub(crate) fn new(
        config: Arc<MonitorConfig>,
        env: EnvConfig,
        logger: Arc<Logger>,
        hooks: Arc<HookSet>,
        parent_token: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_LEN);
        (
            Arc::new(Self {
                config,
                env,
                logger,
                hooks,
                token: parent_token.child_token(),
                trigger_tx,
                tracker: TaskTracker::new(),
            }),
            trigger_rx,
        )
    }

    /// Bring the pipeline up: RTSP paths, HLS muxers, recorder, encoder
    /// supervisors, then the start hooks.
    pub(crate) async fn start(
        self: &Arc<Self>,
        server: &Arc<RtspServer>,
        trigger_rx: mpsc::Receiver<Event>,
    ) -> Result<()> {
        let id = &self.config.id;
        let main_path = server.register_path(id).await;

        let hls = HlsMuxer::new(self.env.hls_dir().join(id)).await?;
        hls.start(self.token.child_token(), main_path.subscribe_au());

        if self.config.sub_input.is_some() {
            let sub_name = format!("{id}_sub");
            let sub_path = server.register_path(&sub_name).await;
            let sub_hls = HlsMuxer::new(self.env.hls_dir().join(&sub_name)).await?;
            sub_hls.start(self.token.child_token(), sub_path.subscribe_au());
        }

        let recorder = Arc::new(Recorder {
            monitor_id: id.clone(),
            always_record: self.config.always_record,
            video_length: self.config.video_length_duration(),
            timestamp_offset: self.config.timestamp_offset_duration(),
            recordings_dir: self.env.recordings_dir(),
            ffmpeg_bin: self.env.ffmpeg_bin.clone(),
            hls,
            logger: self.logger.clone(),
            hooks: self.recorder_hooks(),
        });
        let recorder_token = self.token.clone();
        self.tracker
            .spawn(recorder.run(recorder_token, trigger_rx));

        let main = self.clone();
        self.tracker.spawn(encoder_loop(main, false));
        if self.config.sub_input.is_some() {
            let sub = self.clone();
            self.tracker.spawn(encoder_loop(sub, true));
        }

        for hook in &self.hooks.on_start {
            if let Err(e) = hook(self) {
                self.logger
                    .warn()
                    .source("monitors")
                    .monitor(id)
                    .msg(format!("start hook: {e}"))
                    .await;
            }
        }

        self.logger
            .info()
            .source("monitors")
            .monitor(id)
            .msg(format!("{}: started", self.config.name))
            .await;
        Ok(())
    }

    /// Cancel the lifetime token and wait for every per-monitor task.
    pub(crate) async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.logger
            .info()
            .source("monitors")
            .monitor(&self.config.id)
            .msg(format!("{}: stopped", self.config.name))
            .await;
    }

    fn recorder_hooks(self: &Arc<Self>) -> RecorderHooks {
        let save_hooks = self.hooks.clone();
        let save_config = self.config.clone();
        let saved_hooks = self.hooks.clone();
        RecorderHooks {
            on_rec_save: Some(Arc::new(move |_: &str, args: &mut Vec<String>| {
                for hook in &save_hooks.on_rec_save {
                    hook(&save_config, args);
                }
            })),
            on_rec_saved: Some(Arc::new(
                move |path: &std::path::Path, data: &crate::recorder::RecordingData| {
                    for hook in &saved_hooks.on_rec_saved {
                        hook(path, data);
                    }
                },
            )),
        }
    }
}

/// Command line of the main or sub encoder: pull the camera stream and
/// re-publish it to the local RTSP server.
pub fn encoder_args(config: &MonitorConfig, env: &EnvConfig, sub: bool) -> Vec<String> {
    let input = if sub {
        config.sub_input.as_deref().unwrap_or(&config.main_input)
    } else {
        &config.main_input
    };
    let path = if sub {
        format!("{}_sub", config.id)
    } else {
        config.id.clone()
    };

    let mut args: Vec<String> = parse_args("-loglevel error -rtsp_transport tcp");
    if !config.hwaccel.is_empty() {
        args.extend(parse_args(&format!("-hwaccel {}", config.hwaccel)));
    }
    args.push("-i".to_string());
    args.push(input.to_string());
    if config.audio_enabled {
        let audio = if config.audio_encoder.is_empty() {
            "-c:a copy"
        } else {
            &config.audio_encoder
        };
        args.extend(parse_args(audio));
    } else {
        args.push("-an".to_string());
    }
    let video = if config.video_encoder.is_empty() {
        "-c:v copy"
    } else {
        &config.video_encoder
    };
    args.extend(parse_args(video));
    args.extend(parse_args("-f rtsp -rtsp_transport tcp"));
    args.push(format!("rtsp://127.0.0.1:{}/{}", env.rtsp_port, path));
    args
}

/// Supervise one encoder subprocess, restarting with back-off until the
/// monitor stops.
async fn encoder_loop(monitor: Arc<Monitor>, sub: bool) {
    let label = if sub { "sub" } else { "main" };
    loop {
        if monitor.token.is_cancelled() {
            return;
        }

        let mut args = encoder_args(&monitor.config, &monitor.env, sub);
        if !sub {
            for hook in &monitor.hooks.on_start_process {
                hook(&monitor, &mut args);
            }
        }

        monitor
            .logger
            .info()
            .source("monitors")
            .monitor(&monitor.config.id)
            .msg(format!(
                "starting {label} process: {} {}",
                monitor.env.ffmpeg_bin,
                args.join(" ")
            ))
            .await;

        let process = Process::new(&monitor.env.ffmpeg_bin, &args)
            .prefix(format!("{}: {label} process: ", monitor.config.name))
            .monitor(&monitor.config.id)
            .pipe_level(PipeLevel::Error)
            .logger(monitor.logger.clone());

        if let Err(e) = process.start(monitor.token.clone()).await {
            monitor
                .logger
                .error()
                .source("monitors")
                .monitor(&monitor.config.id)
                .msg(format!("{label} process crashed: {e}"))
                .await;
        }

        tokio::select! {
            _ = monitor.token.cancelled() => return,
            _ = tokio::time::sleep(ENCODER_RESTART_BACKOFF) => {}
        }
    }
}
