//! Capture device seam.
//!
//! The rolling buffer only needs four things from the hardware: open a new
//! recording context, finish a context into one clip, play the
//! synchronization marker, and switch the aux light.  [`CaptureSource`]
//! is that seam; [`FfmpegSource`] implements it by spawning one `ffmpeg`
//! process per context and running configured shell commands for the
//! marker and the light.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use syncam_common::config::Config;

/// One live recorder.  Exactly one exists outside rotations; two during
/// the overlap window.
pub trait RecordingContext: Send + 'static {
    /// Stop recording and return the finished clip.
    fn finish(self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Tear down without producing a clip.
    fn abort(self);
}

pub trait CaptureSource: Send + Sync + 'static {
    type Context: RecordingContext;

    /// Start a new recording context from the live source.  `seq` is the
    /// segment sequence number this context will publish as.
    fn start_context(&self, seq: u64) -> impl Future<Output = Result<Self::Context>> + Send;

    /// Emit the synchronization marker into whatever is recording now.
    fn play_marker(&self) -> impl Future<Output = Result<()>> + Send;

    fn set_light(&self, on: bool) -> impl Future<Output = Result<()>> + Send;

    /// MIME type of finished clips.
    fn content_type(&self) -> &str;

    /// File extension of finished clips, without the dot.
    fn extension(&self) -> &str;
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

/// Input used when `CAPTURE_INPUT` is unset: a synthetic test pattern with
/// a tone, good enough to exercise the whole pipeline on a laptop.
const DEFAULT_INPUT: &str =
    "-re -f lavfi -i testsrc2=size=1280x720:rate=30 -re -f lavfi -i sine=frequency=440:sample_rate=48000";

/// How long `finish` waits for ffmpeg to flush after `q`.
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FfmpegSource {
    input_args: Vec<String>,
    format: String,
    scratch_dir: PathBuf,
    marker_command: Option<String>,
    light_on_command: Option<String>,
    light_off_command: Option<String>,
}

impl FfmpegSource {
    pub fn from_config(config: &Config, scratch_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("Cannot create {}", scratch_dir.display()))?;
        let input = config.capture_input.as_deref().unwrap_or(DEFAULT_INPUT);
        Ok(Self {
            input_args: input.split_whitespace().map(str::to_string).collect(),
            format: config.segment_format.clone(),
            scratch_dir,
            marker_command: config.marker_command.clone(),
            light_on_command: config.light_on_command.clone(),
            light_off_command: config.light_off_command.clone(),
        })
    }

    fn encoder_args(&self) -> Vec<&'static str> {
        match self.format.as_str() {
            "webm" => vec!["-c:v", "libvpx", "-deadline", "realtime", "-c:a", "libopus"],
            // fragmented mp4 stays playable even if ffmpeg is killed
            _ => vec![
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-movflags",
                "+frag_keyframe+empty_moov",
            ],
        }
    }
}

pub struct FfmpegContext {
    seq: u64,
    child: Child,
    path: PathBuf,
}

impl RecordingContext for FfmpegContext {
    async fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(mut stdin) = self.child.stdin.take() {
            // ffmpeg finalizes the container on `q`
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(FINISH_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("ffmpeg context {} exited with {status}", self.seq),
            Ok(Err(e)) => warn!("Cannot wait for ffmpeg context {}: {e}", self.seq),
            Err(_) => {
                warn!("ffmpeg context {} did not stop in time, killing", self.seq);
                let _ = self.child.kill().await;
            }
        }

        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Cannot read segment {}", self.path.display()));
        let _ = tokio::fs::remove_file(&self.path).await;
        let bytes = bytes?;
        if bytes.is_empty() {
            anyhow::bail!("ffmpeg context {} produced an empty segment", self.seq);
        }
        Ok(bytes)
    }

    fn abort(mut self) {
        let _ = self.child.start_kill();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl CaptureSource for FfmpegSource {
    type Context = FfmpegContext;

    async fn start_context(&self, seq: u64) -> Result<FfmpegContext> {
        let path = self
            .scratch_dir
            .join(format!("context-{seq:06}.{}", self.extension()));

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        cmd.args(&self.input_args);
        cmd.args(self.encoder_args());
        cmd.arg(&path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn ffmpeg for context {seq}"))?;

        // Drain stderr so ffmpeg errors show up and the pipe never fills.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!("[ffmpeg {seq}] {line}");
                    }
                }
            });
        }

        debug!("ffmpeg context {seq} recording to {}", path.display());
        Ok(FfmpegContext { seq, child, path })
    }

    async fn play_marker(&self) -> Result<()> {
        match &self.marker_command {
            Some(command) => spawn_shell(command).context("Marker command failed"),
            None => {
                debug!("No MARKER_COMMAND configured, marker skipped");
                Ok(())
            }
        }
    }

    async fn set_light(&self, on: bool) -> Result<()> {
        let command = if on {
            &self.light_on_command
        } else {
            &self.light_off_command
        };
        match command {
            Some(command) => spawn_shell(command).context("Light command failed"),
            None => Ok(()),
        }
    }

    fn content_type(&self) -> &str {
        match self.format.as_str() {
            "webm" => "video/webm",
            _ => "video/mp4",
        }
    }

    fn extension(&self) -> &str {
        &self.format
    }
}

/// Fire-and-forget `sh -c`: the marker must start now, not when the
/// command exits.
fn spawn_shell(command: &str) -> Result<()> {
    let mut child = Command::new("sh")
        .args(["-c", command])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Cannot spawn `{command}`"))?;
    let command = command.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => warn!("`{command}` exited with {status}"),
            Ok(_) => {}
            Err(e) => warn!("Cannot wait for `{command}`: {e}"),
        }
    });
    info!("Spawned signal command");
    Ok(())
}
