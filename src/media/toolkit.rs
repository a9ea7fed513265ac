//! Thin wrappers around ffmpeg/ffprobe subprocess invocations.
//!
//! Every invocation runs inside its own process group and under a watchdog
//! timeout; on timeout or cancellation the whole group is signalled so
//! transcoder child processes do not leak.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, VidsubError};
use crate::media::{parse_time_spec, MediaMetadata, WatermarkPosition, WatermarkSpec};

/// Floor for transcode watchdogs; short clips still need startup time.
const MIN_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Toolkit {
    ffmpeg: String,
    ffprobe: String,
    max_cut: Duration,
}

impl Toolkit {
    pub fn new(config: &Config) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            max_cut: Duration::from_secs(config.max_cut_seconds),
        }
    }

    /// Check that ffmpeg and ffprobe are installed and runnable.
    pub async fn check_binaries(&self) -> Result<()> {
        for bin in [&self.ffmpeg, &self.ffprobe] {
            let status = Command::new(bin)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| {
                    VidsubError::TranscodeFailed(format!(
                        "{bin} not found. Install FFmpeg and ensure it is in PATH: {e}"
                    ))
                })?;
            if !status.success() {
                return Err(VidsubError::TranscodeFailed(format!("{bin} check failed")));
            }
        }
        debug!("ffmpeg and ffprobe are available");
        Ok(())
    }

    /// Container duration via ffprobe.
    pub async fn probe_duration(&self, input: &Path) -> Result<Duration> {
        let output = self
            .run(
                &self.ffprobe,
                &[
                    os("-v"),
                    os("error"),
                    os("-show_entries"),
                    os("format=duration"),
                    os("-of"),
                    os("default=noprint_wrappers=1:nokey=1"),
                    input.into(),
                ],
                PROBE_TIMEOUT,
                &CancellationToken::new(),
            )
            .await?;

        let duration_str = String::from_utf8_lossy(&output);
        let duration_secs: f64 = duration_str.trim().parse().map_err(|_| {
            VidsubError::TranscodeFailed(format!(
                "Failed to parse duration '{}'",
                duration_str.trim()
            ))
        })?;
        Ok(Duration::from_secs_f64(duration_secs))
    }

    /// Full container metadata (dimensions, frame rate, duration, size).
    pub async fn probe_metadata(&self, input: &Path) -> Result<MediaMetadata> {
        let output = self
            .run(
                &self.ffprobe,
                &[
                    os("-v"),
                    os("error"),
                    os("-print_format"),
                    os("json"),
                    os("-show_format"),
                    os("-show_streams"),
                    input.into(),
                ],
                PROBE_TIMEOUT,
                &CancellationToken::new(),
            )
            .await?;

        let parsed: serde_json::Value = serde_json::from_slice(&output)?;
        let format = &parsed["format"];
        let duration_secs: f64 = format["duration"]
            .as_str()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0);
        let file_size = format["size"].as_str().and_then(|s| s.parse().ok());

        let video = parsed["streams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|s| s["codec_type"].as_str() == Some("video"))
            })
            .cloned()
            .unwrap_or_default();

        Ok(MediaMetadata {
            title: input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            duration_ms: (duration_secs * 1000.0) as u64,
            width: video["width"].as_u64().unwrap_or(0) as u32,
            height: video["height"].as_u64().unwrap_or(0) as u32,
            fps: parse_frame_rate(video["r_frame_rate"].as_str().unwrap_or("")),
            file_size_bytes: file_size,
            view_count: None,
            uploader: None,
            thumbnail_url: None,
            source_url: None,
        })
    }

    /// Extract mono 16 kHz PCM audio, reporting progress via callback.
    pub async fn extract_audio<F>(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(f64) + Send,
    {
        let duration = self.probe_duration(input).await.map_err(|e| {
            VidsubError::AudioDecodeFailed(format!("cannot probe input duration: {e}"))
        })?;
        let duration_secs = duration.as_secs_f64().max(0.001);

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-progress", "pipe:1", "-i"])
            .arg(input)
            .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        new_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| VidsubError::AudioDecodeFailed(format!("failed to spawn ffmpeg: {e}")))?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let timeout = tool_timeout(duration);
        let watchdog = tokio::time::sleep(timeout);
        tokio::pin!(watchdog);

        let read_progress = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(us) = line.strip_prefix("out_time_us=") {
                        if let Ok(time_us) = us.trim().parse::<i64>() {
                            if time_us > 0 {
                                progress((time_us as f64 / 1e6 / duration_secs).min(1.0));
                            }
                        }
                    }
                }
            }
            child.wait().await
        };
        tokio::pin!(read_progress);

        let status = tokio::select! {
            status = &mut read_progress => status
                .map_err(|e| VidsubError::AudioDecodeFailed(format!("ffmpeg wait failed: {e}")))?,
            _ = &mut watchdog => {
                kill_group(pid);
                return Err(VidsubError::TranscodeTimeout { seconds: timeout.as_secs() });
            }
            _ = cancel.cancelled() => {
                kill_group(pid);
                return Err(VidsubError::Cancelled);
            }
        };

        if !status.success() {
            return Err(VidsubError::AudioDecodeFailed(
                "ffmpeg audio extraction failed".to_string(),
            ));
        }
        if !output.exists() {
            return Err(VidsubError::AudioDecodeFailed(
                "audio output file was not created".to_string(),
            ));
        }
        Ok(())
    }

    /// Cut `[start, end)` out of a file. Tries a stream copy first and
    /// falls back to re-encoding when the copy fails.
    pub async fn cut(
        &self,
        input: &Path,
        output: &Path,
        start: &str,
        end: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let start_d = parse_time_spec(start)?;
        let end_d = parse_time_spec(end)?;
        if end_d <= start_d {
            return Err(VidsubError::InvalidInput(format!(
                "cut end ({end}) must be after start ({start})"
            )));
        }
        if end_d - start_d > self.max_cut {
            return Err(VidsubError::InvalidInput(format!(
                "cut span exceeds the {}s limit",
                self.max_cut.as_secs()
            )));
        }

        let span = end_d - start_d;
        let start_arg = format!("{:.3}", start_d.as_secs_f64());
        let end_arg = format!("{:.3}", end_d.as_secs_f64());

        let fast: Vec<OsString> = vec![
            os("-y"),
            os("-ss"),
            os(&start_arg),
            os("-to"),
            os(&end_arg),
            os("-i"),
            input.into(),
            os("-c"),
            os("copy"),
            output.into(),
        ];
        let safe: Vec<OsString> = vec![
            os("-y"),
            os("-ss"),
            os(&start_arg),
            os("-to"),
            os(&end_arg),
            os("-i"),
            input.into(),
            os("-c:v"),
            os("libx264"),
            os("-preset"),
            os("veryfast"),
            os("-c:a"),
            os("aac"),
            output.into(),
        ];

        self.run_with_fallback("cut", &fast, &safe, tool_timeout(span), cancel)
            .await
    }

    /// Concatenate files. Stream-copy via the concat demuxer first, filter
    /// concat with re-encode as the fallback.
    pub async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if inputs.len() < 2 {
            return Err(VidsubError::InvalidInput(
                "merge needs at least two inputs".to_string(),
            ));
        }

        let mut total = Duration::ZERO;
        for input in inputs {
            total += self.probe_duration(input).await?;
        }
        let timeout = tool_timeout(total);

        let list_path = output.with_extension("concat.txt");
        let list = inputs
            .iter()
            .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', "'\\''")))
            .collect::<String>();
        tokio::fs::write(&list_path, list).await?;

        let fast: Vec<OsString> = vec![
            os("-y"),
            os("-f"),
            os("concat"),
            os("-safe"),
            os("0"),
            os("-i"),
            list_path.as_path().into(),
            os("-c"),
            os("copy"),
            output.into(),
        ];

        let mut safe: Vec<OsString> = vec![os("-y")];
        for input in inputs {
            safe.push(os("-i"));
            safe.push(input.into());
        }
        let filter = format!(
            "{}concat=n={}:v=1:a=1[v][a]",
            (0..inputs.len())
                .map(|i| format!("[{i}:v][{i}:a]"))
                .collect::<String>(),
            inputs.len()
        );
        safe.extend([
            os("-filter_complex"),
            os(&filter),
            os("-map"),
            os("[v]"),
            os("-map"),
            os("[a]"),
            output.into(),
        ]);

        let result = self
            .run_with_fallback("merge", &fast, &safe, timeout, cancel)
            .await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result
    }

    /// Render subtitles into the video stream.
    pub async fn burn_subtitles(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let duration = self.probe_duration(video).await?;
        let filter = format!("subtitles={}", escape_filter_path(subtitles));
        let args: Vec<OsString> = vec![
            os("-y"),
            os("-i"),
            video.into(),
            os("-vf"),
            os(&filter),
            os("-c:a"),
            os("copy"),
            output.into(),
        ];
        self.run(&self.ffmpeg, &args, tool_timeout(duration), cancel)
            .await?;
        Ok(())
    }

    /// Overlay a logo in a corner of the frame.
    pub async fn overlay_watermark(
        &self,
        video: &Path,
        spec: &WatermarkSpec,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let duration = self.probe_duration(video).await?;

        let logo_path = output.with_extension("logo.png");
        tokio::fs::write(&logo_path, &spec.logo_bytes).await?;

        let filter = watermark_filter(spec);

        let args: Vec<OsString> = vec![
            os("-y"),
            os("-i"),
            video.into(),
            os("-i"),
            logo_path.as_path().into(),
            os("-filter_complex"),
            os(&filter),
            os("-c:a"),
            os("copy"),
            output.into(),
        ];

        let result = self
            .run(&self.ffmpeg, &args, tool_timeout(duration), cancel)
            .await;
        let _ = tokio::fs::remove_file(&logo_path).await;
        result.map(|_| ())
    }

    async fn run_with_fallback(
        &self,
        op: &str,
        fast: &[OsString],
        safe: &[OsString],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.run(&self.ffmpeg, fast, timeout, cancel).await {
            Ok(_) => Ok(()),
            Err(e @ (VidsubError::Cancelled | VidsubError::TranscodeTimeout { .. })) => Err(e),
            Err(e) => {
                warn!("{op} fast path failed ({e}), re-encoding");
                self.run(&self.ffmpeg, safe, timeout, cancel).await?;
                Ok(())
            }
        }
    }

    /// Run a tool to completion under the watchdog, returning stdout.
    async fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        debug!("running {program} {:?}", args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        new_process_group(&mut cmd);

        let child = cmd
            .spawn()
            .map_err(|e| VidsubError::TranscodeFailed(format!("failed to spawn {program}: {e}")))?;
        let pid = child.id();

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| VidsubError::TranscodeFailed(format!("{program} wait failed: {e}")))?,
            _ = tokio::time::sleep(timeout) => {
                kill_group(pid);
                return Err(VidsubError::TranscodeTimeout { seconds: timeout.as_secs() });
            }
            _ = cancel.cancelled() => {
                kill_group(pid);
                return Err(VidsubError::Cancelled);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(VidsubError::TranscodeFailed(format!(
                "{program} exited with {}: {tail}",
                output.status
            )));
        }

        Ok(output.stdout)
    }
}

fn os(s: &str) -> OsString {
    OsString::from(s)
}

fn tool_timeout(media_duration: Duration) -> Duration {
    (media_duration * 3).max(MIN_TOOL_TIMEOUT)
}

fn parse_frame_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}

/// Scale, fade and pin the logo into the chosen corner.
fn watermark_filter(spec: &WatermarkSpec) -> String {
    let margin = 10;
    let (x, y) = match spec.position {
        WatermarkPosition::Tl => (format!("{margin}"), format!("{margin}")),
        WatermarkPosition::Tr => (format!("W-w-{margin}"), format!("{margin}")),
        WatermarkPosition::Bl => (format!("{margin}"), format!("H-h-{margin}")),
        WatermarkPosition::Br => (format!("W-w-{margin}"), format!("H-h-{margin}")),
    };
    let alpha = f64::from(spec.opacity.min(100)) / 100.0;
    format!(
        "[1:v]scale={}:-1,format=rgba,colorchannelmixer=aa={alpha:.2}[wm];[0:v][wm]overlay={x}:{y}",
        spec.size.width_px()
    )
}

/// Escape a path for use inside an ffmpeg filter argument.
fn escape_filter_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

pub(crate) fn new_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Signal the whole process group so transcoder children die with the
/// leader.
pub(crate) fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
