//! Capture process management.
//!
//! The capture tool (ffmpeg) is an opaque, crash-prone external dependency
//! that can also hang without exiting, so it sits behind a small trait pair:
//! a backend that launches processes and a handle for liveness, output
//! activity and termination. The supervisor only ever talks to these traits,
//! which keeps its restart logic testable without spawning real processes.

use crate::config::{CameraSource, RecordingConfig};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Timestamp layout embedded in segment file names.
const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Errors from launching or controlling a capture process.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture binary {binary:?} could not be started: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("capture process exited during startup ({status})")]
    DiedOnStart { status: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Launches one capture process for a camera.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    async fn start(&self, camera: &CameraSource)
        -> Result<Box<dyn CaptureProcess>, CaptureError>;
}

/// A live (or recently live) capture process.
#[async_trait]
pub trait CaptureProcess: Send {
    /// OS pid, if the process reached the running state.
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// When the process last produced output, as far as we can observe.
    /// Used by the supervisor's zombie detection.
    async fn last_output_activity(&mut self) -> Option<DateTime<Utc>>;

    /// Stop the process: graceful quit first, force-kill after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Production backend: spawns ffmpeg with time-segmented output.
pub struct FfmpegBackend {
    config: RecordingConfig,
}

impl FfmpegBackend {
    pub fn new(config: RecordingConfig) -> Self {
        Self { config }
    }

    /// Directory a camera's segments are written into.
    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.config.recordings_dir.join(camera_id)
    }

    /// Build the ffmpeg argument list for one camera.
    ///
    /// `-c:v copy` avoids re-encoding; `-f segment` rotates output files
    /// every `segment_duration_seconds`; `-strftime 1` stamps each file
    /// name with its start time, which the rest of the pipeline parses.
    fn build_args(&self, camera: &CameraSource) -> Vec<String> {
        let output_pattern = self
            .camera_dir(&camera.id)
            .join(format!("{}_{}.mp4", camera.id, SEGMENT_TIMESTAMP_FORMAT))
            .to_string_lossy()
            .into_owned();

        let mut args = vec![
            "-hide_banner".to_string(),
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-i".to_string(),
            camera.source_url.clone(),
            "-c:v".to_string(),
            self.config.video_codec.clone(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
        ];

        if let Some(mbps) = self.config.max_bitrate_mbps {
            args.push("-maxrate".to_string());
            args.push(format!("{mbps}M"));
            args.push("-bufsize".to_string());
            args.push(format!("{}M", mbps * 2));
        }

        args.extend([
            "-f".to_string(),
            "segment".to_string(),
            "-segment_time".to_string(),
            self.config.segment_duration_seconds.to_string(),
            "-segment_format".to_string(),
            "mp4".to_string(),
            "-strftime".to_string(),
            "1".to_string(),
            "-reset_timestamps".to_string(),
            "1".to_string(),
            "-y".to_string(),
            output_pattern,
        ]);

        args
    }
}

#[async_trait]
impl CaptureBackend for FfmpegBackend {
    async fn start(
        &self,
        camera: &CameraSource,
    ) -> Result<Box<dyn CaptureProcess>, CaptureError> {
        let output_dir = self.camera_dir(&camera.id);
        tokio::fs::create_dir_all(&output_dir).await?;

        let args = self.build_args(camera);

        debug!(
            camera_id = %camera.id,
            binary = %self.config.ffmpeg_binary,
            args = %args.join(" "),
            "Spawning capture process"
        );

        let mut child = Command::new(&self.config.ffmpeg_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                binary: self.config.ffmpeg_binary.clone(),
                source,
            })?;

        drain_stderr(&mut child, camera.id.clone());

        // Immediate-death probe: a bad URL or missing codec makes ffmpeg
        // exit within a moment of starting, which should be reported as a
        // start failure rather than discovered by the next health check.
        tokio::time::sleep(self.config.startup_probe()).await;
        if let Some(status) = child.try_wait()? {
            return Err(CaptureError::DiedOnStart {
                status: status.to_string(),
            });
        }

        Ok(Box::new(FfmpegProcess { child, output_dir }))
    }
}

/// Forward the capture process's stderr into our logs. ffmpeg writes its
/// progress and errors there, and an unread pipe would eventually block it.
fn drain_stderr(child: &mut Child, camera_id: String) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.to_lowercase().contains("error") {
                warn!(camera_id = %camera_id, "capture: {line}");
            } else {
                debug!(camera_id = %camera_id, "capture: {line}");
            }
        }
    });
}

/// Handle to a running ffmpeg process.
pub struct FfmpegProcess {
    child: Child,
    output_dir: PathBuf,
}

#[async_trait]
impl CaptureProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn last_output_activity(&mut self) -> Option<DateTime<Utc>> {
        newest_segment_mtime(&self.output_dir).await
    }

    async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        if let Some(stdin) = self.child.stdin.as_mut() {
            // Graceful quit; ffmpeg finalizes the open segment.
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!(error = %e, "Could not reach capture process stdin");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(status = %status, "Capture process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for capture process");
            }
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Capture process ignored graceful quit, force-killing"
                );
                if let Err(e) = self.child.start_kill() {
                    warn!(error = %e, "Force-kill failed");
                }
                let _ = self.child.wait().await;
            }
        }
    }
}

/// Modification time of the newest segment file in a directory.
async fn newest_segment_mtime(dir: &Path) -> Option<DateTime<Utc>> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<DateTime<Utc>> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let modified: DateTime<Utc> = modified.into();
        if newest.map_or(true, |n| modified > n) {
            newest = Some(modified);
        }
    }
    newest
}

/// Parse the start timestamp out of a segment file name of the form
/// `{camera_id}_{%Y-%m-%d_%H-%M-%S}.mp4`. Returns `None` for names the
/// capture process did not produce.
pub fn parse_segment_timestamp(file_name: &str, camera_id: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(".mp4")?;
    let timestamp = stem.strip_prefix(camera_id)?.strip_prefix('_')?;
    NaiveDateTime::parse_from_str(timestamp, SEGMENT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
