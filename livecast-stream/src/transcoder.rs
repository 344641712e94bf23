// Transcoder collaborator
//
// The lifecycle controller only starts and stops invocations. Each running
// invocation is one background task behind a `TranscodeHandle`; stopping it
// cancels the task and waits until the task (and its child process) is gone.

use async_trait::async_trait;
use livecast_core::config::StreamQuality;
use livecast_core::{Error, Result};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Name of the master playlist written at the staging root
pub const MASTER_PLAYLIST: &str = "stream.m3u8";

/// Which content an invocation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Bundled placeholder, looped forever
    OfflinePlaceholder,
    /// Inbound broadcaster source
    Live,
}

impl InputKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfflinePlaceholder => "offline",
            Self::Live => "live",
        }
    }
}

/// Everything a transcoder needs for one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeJob {
    pub input: String,
    pub kind: InputKind,
    pub segment_length_seconds: u32,
    pub playlist_length: u32,
    /// Private staging root; rendition `i` goes to `<output_dir>/<i>/`
    pub output_dir: PathBuf,
    pub qualities: Vec<StreamQuality>,
}

/// A running transcoder invocation.
pub struct TranscodeHandle {
    job: TranscodeJob,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl TranscodeHandle {
    /// Run `work` as the background worker of `job`.
    ///
    /// `work` must return once the token it receives is cancelled.
    pub fn spawn<F, Fut>(job: TranscodeJob, work: F) -> Self
    where
        F: FnOnce(TranscodeJob, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("transcode", kind = job.kind.as_str());
        let worker = tokio::spawn(work(job.clone(), cancel.clone()).instrument(span));
        Self {
            job,
            cancel,
            worker: Some(worker),
        }
    }

    #[must_use]
    pub fn job(&self) -> &TranscodeJob {
        &self.job
    }

    /// Whether the worker exited on its own
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the invocation and wait until it is fully gone.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Transcoder worker failed: {}", e);
            }
        }
        debug!(input = %self.job.input, "Transcoder invocation stopped");
    }
}

impl Drop for TranscodeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts transcoder invocations.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Start an invocation. Failing to launch is reported here, not later.
    async fn start(&self, job: TranscodeJob) -> Result<TranscodeHandle>;
}

/// Transcoder backed by an `ffmpeg` child process writing HLS output.
pub struct FfmpegTranscoder {
    binary_path: String,
}

impl FfmpegTranscoder {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Build ffmpeg command arguments.
    fn build_args(job: &TranscodeJob) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning"]
            .iter()
            .map(ToString::to_string)
            .collect();

        // Placeholder content is a short file played on repeat in real time
        if job.kind == InputKind::OfflinePlaceholder {
            args.extend(["-stream_loop", "-1", "-re"].map(String::from));
        }
        args.extend(["-i".to_string(), job.input.clone()]);

        let qualities = if job.qualities.is_empty() {
            vec![StreamQuality::default()]
        } else {
            job.qualities.clone()
        };

        let mut stream_map = Vec::with_capacity(qualities.len());
        for (index, quality) in qualities.iter().enumerate() {
            args.extend(["-map", "0:v:0", "-map", "0:a:0"].map(String::from));

            if quality.passthrough {
                args.extend([format!("-c:v:{index}"), "copy".to_string()]);
            } else {
                args.extend([
                    format!("-c:v:{index}"),
                    "libx264".to_string(),
                    format!("-b:v:{index}"),
                    format!("{}k", quality.video_bitrate_kbps),
                ]);
                if let Some(height) = quality.scaled_height {
                    args.extend([format!("-filter:v:{index}"), format!("scale=-2:{height}")]);
                }
                if let Some(fps) = quality.framerate {
                    args.extend([format!("-r:v:{index}"), fps.to_string()]);
                }
            }
            stream_map.push(format!("v:{index},a:{index}"));
        }

        args.extend(["-c:a", "aac", "-preset", "veryfast", "-sc_threshold", "0"].map(String::from));

        let output = job.output_dir.to_string_lossy();
        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            job.segment_length_seconds.to_string(),
            "-hls_list_size".to_string(),
            job.playlist_length.to_string(),
            "-hls_delete_threshold".to_string(),
            "10".to_string(),
            "-hls_flags".to_string(),
            "delete_segments+program_date_time+temp_file".to_string(),
            "-var_stream_map".to_string(),
            stream_map.join(" "),
            "-master_pl_name".to_string(),
            MASTER_PLAYLIST.to_string(),
            "-hls_segment_filename".to_string(),
            format!("{output}/%v/stream-%d.ts"),
            format!("{output}/%v/stream.m3u8"),
        ]);

        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, job: TranscodeJob) -> Result<TranscodeHandle> {
        let args = Self::build_args(&job);

        info!(
            "Starting {} transcoder for {} with {} rendition(s)",
            job.kind.as_str(),
            job.input,
            job.qualities.len().max(1)
        );
        debug!("ffmpeg args: {:?}", args);

        let child = Command::new(&self.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transcoder(format!("failed to spawn {}: {e}", self.binary_path)))?;

        Ok(TranscodeHandle::spawn(job, |_, cancel| supervise(child, cancel)))
    }
}

/// Forward ffmpeg's stderr to the log until it exits or is cancelled.
async fn supervise(mut child: Child, cancel: CancellationToken) {
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill ffmpeg: {}", e);
                }
                break;
            }
            status = child.wait() => {
                match status {
                    Ok(status) if status.success() => info!("ffmpeg exited"),
                    Ok(status) => warn!("ffmpeg exited with {}", status),
                    Err(e) => error!("Failed to wait for ffmpeg: {}", e),
                }
                break;
            }
            line = next_line(&mut stderr) => match line {
                Some(line) => warn!(target: "ffmpeg", "{}", line),
                None => stderr = None,
            },
        }
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
