//! Child-process supervisor
//!
//! Runs external encoder subprocesses (ffmpeg) with graceful-then-forceful
//! termination and pipes their output into the log bus.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::log_bus::{LogLevel, Logger};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Output classification for piped subprocess lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeLevel {
    Quiet,
    Error,
    Warning,
    Info,
    Debug,
}

impl PipeLevel {
    pub fn parse(s: &str) -> Self {
        match s {
            "quiet" => Self::Quiet,
            "fatal" | "error" => Self::Error,
            "warning" => Self::Warning,
            "debug" => Self::Debug,
            _ => Self::Info,
        }
    }

    fn bus_level(self) -> Option<LogLevel> {
        match self {
            Self::Quiet => None,
            Self::Error => Some(LogLevel::Error),
            Self::Warning => Some(LogLevel::Warning),
            Self::Info => Some(LogLevel::Info),
            Self::Debug => Some(LogLevel::Debug),
        }
    }
}

/// One supervised subprocess run. Build, then `start`.
pub struct Process {
    cmd: Command,
    timeout: Duration,
    prefix: String,
    monitor_id: String,
    level: PipeLevel,
    logger: Option<Arc<Logger>>,
    line_tx: Option<mpsc::Sender<String>>,
}

impl Process {
    pub fn new(bin: &str, args: &[String]) -> Self {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        Self {
            cmd,
            timeout: DEFAULT_STOP_TIMEOUT,
            prefix: String::new(),
            monitor_id: String::new(),
            level: PipeLevel::Info,
            logger: None,
            line_tx: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn monitor(mut self, monitor_id: impl Into<String>) -> Self {
        self.monitor_id = monitor_id.into();
        self
    }

    pub fn pipe_level(mut self, level: PipeLevel) -> Self {
        self.level = level;
        self
    }

    /// Attach the log bus; stdout and stderr lines are forwarded to it.
    pub fn logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Additionally deliver raw stderr lines to a channel (used by the
    /// motion detector's score parser).
    pub fn stderr_lines(mut self, line_tx: mpsc::Sender<String>) -> Self {
        self.line_tx = Some(line_tx);
        self
    }

    /// Run the subprocess until it exits or `token` is cancelled.
    /// Cancellation sends SIGINT, waits up to the stop timeout, then SIGKILL.
    /// ffmpeg exits with status 255 on SIGINT; that is treated as normal.
    pub async fn start(mut self, token: CancellationToken) -> Result<()> {
        let pipe_output = self.logger.is_some() || self.line_tx.is_some();
        if pipe_output {
            self.cmd.stdout(Stdio::piped());
            self.cmd.stderr(Stdio::piped());
        } else {
            self.cmd.stdout(Stdio::null());
            self.cmd.stderr(Stdio::null());
        }

        let mut child = self
            .cmd
            .spawn()
            .map_err(|e| Error::Process(format!("spawn: {e}")))?;

        if pipe_output {
            if let Some(stdout) = child.stdout.take() {
                self.attach_pump(self.logger.clone(), None, "stdout", stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                self.attach_pump(
                    self.logger.clone(),
                    self.line_tx.clone(),
                    "stderr",
                    stderr,
                );
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                stop(&mut child, self.timeout).await?
            }
        };

        match status.code() {
            Some(0) | Some(255) => Ok(()),
            // Terminated by signal, no exit code. Expected during stop.
            None => Ok(()),
            Some(code) => Err(Error::Process(format!("exit status {code}"))),
        }
    }

    fn attach_pump(
        &self,
        logger: Option<Arc<Logger>>,
        line_tx: Option<mpsc::Sender<String>>,
        label: &'static str,
        pipe: impl AsyncRead + Unpin + Send + 'static,
    ) {
        let level = self.level.bus_level();
        let prefix = self.prefix.clone();
        let monitor_id = self.monitor_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(line_tx) = &line_tx {
                    let _ = line_tx.send(line.clone()).await;
                }
                let (Some(logger), Some(level)) = (&logger, level) else {
                    continue;
                };
                let msg = format!("{prefix}{label}: {line}");
                let event = match level {
                    LogLevel::Error => logger.error(),
                    LogLevel::Warning => logger.warn(),
                    LogLevel::Info => logger.info(),
                    LogLevel::Debug => logger.debug(),
                };
                event.source("ffmpeg").monitor(&monitor_id).msg(msg).await;
            }
        });
    }
}

/// Interrupt, wait up to `timeout`, then kill. Idempotent: a process that
/// already exited is reaped without error.
async fn stop(
    child: &mut tokio::process::Child,
    timeout: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Create a named pipe, replacing anything already at `path`.
pub fn make_pipe(path: &Path) -> Result<()> {
    let _ = std::fs::remove_file(path);
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| Error::Resource(format!("mkfifo {}: {e}", path.display())))
}

/// Split an argument template on whitespace.
pub fn parse_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(|s| s.to_string()).collect()
}

/// Probe a stream's frame size with ffmpeg.
pub async fn size_from_stream(bin: &str, url: &str) -> Result<(u32, u32)> {
    let output = Command::new(bin)
        .args(["-i", url, "-f", "ffmetadata", "-"])
        .output()
        .await
        .map_err(|e| Error::Process(format!("probe spawn: {e}")))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    parse_size(&stderr).ok_or_else(|| Error::Process(format!("no size in probe output: {stderr}")))
}

/// Extract "WxH" from probe output like
/// "Stream #0:0: Video: h264 (Main), yuv420p(progressive), 720x1280, 30 fps".
pub fn parse_size(stderr: &str) -> Option<(u32, u32)> {
    static SIZE_RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\b(\d+)x(\d+)\b").expect("static regex"));
    let captures = SIZE_RE.captures(stderr)?;
    Some((
        captures.get(1)?.as_str().parse().ok()?,
        captures.get(2)?.as_str().parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        assert_eq!(
            parse_args(" -c:v copy  -f hls "),
            vec!["-c:v", "copy", "-f", "hls"]
        );
        assert!(parse_args("").is_empty());
    }

    #[test]
    fn test_pipe_level_parse() {
        assert_eq!(PipeLevel::parse("quiet"), PipeLevel::Quiet);
        assert_eq!(PipeLevel::parse("fatal"), PipeLevel::Error);
        assert_eq!(PipeLevel::parse("error"), PipeLevel::Error);
        assert_eq!(PipeLevel::parse("warning"), PipeLevel::Warning);
        assert_eq!(PipeLevel::parse("debug"), PipeLevel::Debug);
        assert_eq!(PipeLevel::parse("anything"), PipeLevel::Info);
    }

    #[tokio::test]
    async fn test_normal_exit() {
        let process = Process::new("true", &[]);
        process.start(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let process = Process::new("false", &[]);
        let err = process.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }

    #[tokio::test]
    async fn test_exit_255_is_normal() {
        let process = Process::new("sh", &["-c".to_string(), "exit 255".to_string()]);
        process.start(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_process() {
        let token = CancellationToken::new();
        let process = Process::new("sleep", &["30".to_string()]);

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let start = std::time::Instant::now();
        // sleep does not handle SIGINT specially and dies from it.
        process.start(token).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(
            parse_size("Stream #0:0: Video: h264 (Main), yuv420p, 720x1280, 30 fps"),
            Some((720, 1280))
        );
        assert_eq!(parse_size("no size here"), None);
    }

    #[test]
    fn test_make_pipe() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("main.fifo");
        make_pipe(&path).unwrap();
        // Replacing an existing pipe succeeds.
        make_pipe(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(meta.file_type().is_fifo());
    }
}
