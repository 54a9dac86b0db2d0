//! nvrd - network video recorder
//!
//! ## Architecture
//!
//! 1. LogBus - process-wide log pub/sub and persistent store
//! 2. Process - child-process supervision for the ffmpeg encoders
//! 3. RtspServer - stream termination and re-publishing
//! 4. HlsMuxer - live playlist + segments per monitor
//! 5. Recorder - event-triggered recordings with sidecar metadata
//! 6. MonitorManager - per-monitor pipeline supervision
//! 7. MotionDetector - optional scene-score trigger pipeline
//! 8. StorageManager - recordings tree, queries and disk quota
//! 9. WebApi - REST surface, WebSocket log feed, HLS serving
//!
//! ## Design Principles
//!
//! - One cancellation token per monitor run; closing it is the only stop
//!   signal
//! - Per-session and per-monitor errors never terminate the process
//! - Media flows camera -> encoder -> RTSP -> HLS directly, never through
//!   the log bus

pub mod config;
pub mod error;
pub mod group;
pub mod hls;
pub mod log_bus;
pub mod monitor;
pub mod motion;
pub mod process;
pub mod recorder;
pub mod rtsp;
pub mod state;
pub mod storage;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
