//! Local whisper.cpp CLI backend.
//!
//! Runs the `whisper-cli` binary as a subprocess and parses its timestamped
//! stdout lines as they stream, so downstream consumers see segments while
//! later audio is still being decoded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, VidsubError};
use crate::media::toolkit::{kill_group, new_process_group};
use crate::subtitle::Segment;
use crate::transcribe::{SpeechBackend, TranscribeOptions};

pub struct WhisperCppBackend {
    bin: String,
    model_dir: PathBuf,
}

impl WhisperCppBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.whisper_path.clone(),
            model_dir: config.whisper_model_dir.clone(),
        }
    }

    pub async fn check_binary(&self) -> Result<()> {
        let status = Command::new(&self.bin)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                VidsubError::BackendUnavailable(format!("{} not found: {e}", self.bin))
            })?;
        if !status.success() {
            return Err(VidsubError::BackendUnavailable(format!(
                "{} check failed",
                self.bin
            )));
        }
        Ok(())
    }

    fn model_path(&self, opts: &TranscribeOptions) -> Result<PathBuf> {
        let path = self.model_dir.join(opts.model.file_name());
        if !path.exists() {
            return Err(VidsubError::ModelLoadFailed(format!(
                "model file {} not found; download it into {}",
                opts.model.file_name(),
                self.model_dir.display()
            )));
        }
        Ok(path)
    }
}

/// `[00:00:00.000 --> 00:00:02.540]   text`
fn segment_line_regex() -> Regex {
    Regex::new(r"^\[(\d{2,}:\d{2}:\d{2}[.,]\d{3})\s*-->\s*(\d{2,}:\d{2}:\d{2}[.,]\d{3})\]\s*(.*)$")
        .expect("static regex")
}

/// `whisper_full_with_state: auto-detected language: en (p = 0.976396)`
fn language_line_regex() -> Regex {
    Regex::new(r"auto-detected language:\s*([a-z]{2,3})").expect("static regex")
}

fn parse_clock(s: &str) -> Option<Duration> {
    let s = s.replace(',', ".");
    let mut fields = s.split(':');
    let hours: u64 = fields.next()?.parse().ok()?;
    let minutes: u64 = fields.next()?.parse().ok()?;
    let seconds: f64 = fields.next()?.parse().ok()?;
    Some(Duration::from_secs_f64(
        (hours * 3600 + minutes * 60) as f64 + seconds,
    ))
}

#[async_trait]
impl SpeechBackend for WhisperCppBackend {
    async fn transcribe(
        &self,
        audio: &Path,
        opts: &TranscribeOptions,
        tx: mpsc::Sender<Segment>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if !audio.exists() {
            return Err(VidsubError::NotFound(audio.display().to_string()));
        }
        let model_path = self.model_path(opts)?;
        let lang = opts.source_lang.clone().unwrap_or_else(|| "auto".to_string());

        debug!(
            "transcribing {} with model {} (lang {lang})",
            audio.display(),
            opts.model
        );

        let mut cmd = Command::new(&self.bin);
        cmd.arg("-m")
            .arg(&model_path)
            .arg("-f")
            .arg(audio)
            .args(["-l", &lang, "--no-prints"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        new_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            VidsubError::BackendUnavailable(format!("failed to spawn {}: {e}", self.bin))
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VidsubError::BackendUnavailable("no stdout from whisper".into()))?;
        let stderr = child.stderr.take();

        let seg_re = segment_line_regex();
        let lang_re = language_line_regex();
        let mut detected = opts.source_lang.clone();
        let mut stderr_tail = String::new();

        // Collect stderr concurrently; the detected-language line arrives
        // there before the first segment is printed.
        let stderr_task = tokio::spawn(async move {
            let mut detected_lang = None;
            let mut tail = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(caps) = lang_re.captures(&line) {
                        detected_lang = Some(caps[1].to_string());
                    }
                    tail = line;
                }
            }
            (detected_lang, tail)
        });

        let mut lines = BufReader::new(stdout).lines();

        let stream = async {
            let mut index = 0usize;
            while let Some(line) = lines.next_line().await.map_err(VidsubError::Io)? {
                let Some(caps) = seg_re.captures(&line) else {
                    continue;
                };
                let (Some(start), Some(end)) = (parse_clock(&caps[1]), parse_clock(&caps[2]))
                else {
                    continue;
                };
                let text = caps[3].trim().to_string();
                if text.is_empty() || start >= end {
                    continue;
                }

                let segment = Segment {
                    index,
                    start,
                    end,
                    text,
                };
                index += 1;

                // A closed receiver means downstream gave up; stop decoding.
                if tx.send(segment).await.is_err() {
                    break;
                }
            }
            let status = child.wait().await.map_err(|e| {
                VidsubError::BackendUnavailable(format!("whisper wait failed: {e}"))
            })?;
            Ok::<_, VidsubError>((status, index))
        };
        tokio::pin!(stream);

        let time_limit = opts.time_limit.unwrap_or(Duration::from_secs(3600));
        let (status, emitted) = tokio::select! {
            outcome = &mut stream => outcome?,
            _ = tokio::time::sleep(time_limit) => {
                kill_group(pid);
                return Err(VidsubError::BackendTimeout(format!(
                    "transcription exceeded {}s", time_limit.as_secs()
                )));
            }
            _ = cancel.cancelled() => {
                kill_group(pid);
                return Err(VidsubError::Cancelled);
            }
        };

        if let Ok((lang_from_stderr, tail)) = stderr_task.await {
            if detected.is_none() {
                detected = lang_from_stderr;
            }
            stderr_tail = tail;
        }

        if !status.success() {
            let lower = stderr_tail.to_lowercase();
            if lower.contains("model") || lower.contains("init") {
                return Err(VidsubError::ModelLoadFailed(stderr_tail));
            }
            return Err(VidsubError::AudioDecodeFailed(format!(
                "whisper exited with {status}: {stderr_tail}"
            )));
        }

        if emitted == 0 {
            warn!("whisper produced no segments for {}", audio.display());
        }

        Ok(detected.unwrap_or_else(|| "unknown".to_string()))
    }

    fn name(&self) -> &'static str {
        "whisper.cpp"
    }
}
