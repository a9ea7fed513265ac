//! Remote media acquisition through yt-dlp.
//!
//! `probe` resolves metadata without downloading; `fetch` downloads a
//! playable container at the requested quality. Refusals are classified
//! into typed errors so the pipeline can tell a bot challenge apart from
//! a dead link.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, VidsubError};
use crate::media::toolkit::{kill_group, new_process_group};
use crate::media::MediaMetadata;

/// Ceiling for a single fetch attempt.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Requested download quality, mapped to yt-dlp format selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchQuality {
    #[default]
    Best,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    Audio,
}

impl FetchQuality {
    fn format_selector(&self) -> &'static str {
        match self {
            FetchQuality::Best => "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/b",
            FetchQuality::P1080 => "bv*[height<=1080][ext=mp4]+ba[ext=m4a]/b[height<=1080]/b",
            FetchQuality::P720 => "bv*[height<=720][ext=mp4]+ba[ext=m4a]/b[height<=720]/b",
            FetchQuality::Audio => "ba/b",
        }
    }
}

impl std::str::FromStr for FetchQuality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best" => Ok(FetchQuality::Best),
            "1080p" | "1080" => Ok(FetchQuality::P1080),
            "720p" | "720" => Ok(FetchQuality::P720),
            "audio" => Ok(FetchQuality::Audio),
            _ => Err(format!(
                "Unknown quality: {s}. Use 'best', '1080p', '720p' or 'audio'"
            )),
        }
    }
}

/// Abstraction over remote media acquisition.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Resolve metadata for a URL without downloading.
    async fn probe(&self, url: &str) -> Result<MediaMetadata>;

    /// Download a playable container into `dest_dir`. Returns the file
    /// path and the metadata probed beforehand.
    async fn fetch(
        &self,
        url: &str,
        quality: FetchQuality,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(PathBuf, MediaMetadata)>;
}

pub struct YtDlpFetcher {
    bin: String,
}

impl YtDlpFetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.ytdlp_path.clone(),
        }
    }

    pub async fn check_binary(&self) -> Result<()> {
        let status = Command::new(&self.bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                VidsubError::Network(format!("{} not found. Install yt-dlp: {e}", self.bin))
            })?;
        if !status.success() {
            return Err(VidsubError::Network(format!("{} check failed", self.bin)));
        }
        Ok(())
    }

    fn validate_url(url: &str) -> Result<()> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(VidsubError::UnsupportedUrl(url.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn probe(&self, url: &str) -> Result<MediaMetadata> {
        Self::validate_url(url)?;
        debug!("probing {url}");

        let mut cmd = Command::new(&self.bin);
        cmd.args(["--dump-json", "--no-download", "--no-playlist", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(60), cmd.output())
            .await
            .map_err(|_| VidsubError::BackendTimeout("metadata probe timed out".to_string()))?
            .map_err(|e| VidsubError::Network(format!("failed to run {}: {e}", self.bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, url));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        Ok(metadata_from_info(&info, url))
    }

    async fn fetch(
        &self,
        url: &str,
        quality: FetchQuality,
        dest_dir: &Path,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(PathBuf, MediaMetadata)> {
        let metadata = self.probe(url).await?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let template = dest_dir.join("source.%(ext)s");
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "--newline",
            "--no-playlist",
            "--no-write-info-json",
            "-f",
            quality.format_selector(),
            "-o",
        ])
        .arg(&template)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        new_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| VidsubError::Network(format!("failed to spawn {}: {e}", self.bin)))?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let percent_re = Regex::new(r"\[download\]\s+([\d.]+)%").expect("static regex");

        let drive = async {
            let mut stderr_buf = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(caps) = percent_re.captures(&line) {
                        if let Ok(pct) = caps[1].parse::<f64>() {
                            progress((pct / 100.0).min(1.0));
                        }
                    }
                }
            }
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("yt-dlp: {line}");
                    stderr_buf.push_str(&line);
                    stderr_buf.push('\n');
                }
            }
            (child.wait().await, stderr_buf)
        };
        tokio::pin!(drive);

        let (status, stderr_buf) = tokio::select! {
            outcome = &mut drive => outcome,
            _ = tokio::time::sleep(FETCH_TIMEOUT) => {
                kill_group(pid);
                return Err(VidsubError::StageTimeout {
                    stage: "fetch".to_string(),
                    seconds: FETCH_TIMEOUT.as_secs(),
                });
            }
            _ = cancel.cancelled() => {
                kill_group(pid);
                return Err(VidsubError::Cancelled);
            }
        };
        let status = status
            .map_err(|e| VidsubError::Network(format!("{} wait failed: {e}", self.bin)))?;

        if !status.success() {
            return Err(classify_failure(&stderr_buf, url));
        }

        let path = find_downloaded_file(dest_dir).await?;
        progress(1.0);
        Ok((path, metadata))
    }
}

fn metadata_from_info(info: &serde_json::Value, url: &str) -> MediaMetadata {
    MediaMetadata {
        title: info["title"].as_str().unwrap_or("untitled").to_string(),
        duration_ms: (info["duration"].as_f64().unwrap_or(0.0) * 1000.0) as u64,
        width: info["width"].as_u64().unwrap_or(0) as u32,
        height: info["height"].as_u64().unwrap_or(0) as u32,
        fps: info["fps"].as_f64().unwrap_or(0.0),
        file_size_bytes: info["filesize"]
            .as_u64()
            .or_else(|| info["filesize_approx"].as_u64()),
        view_count: info["view_count"].as_u64(),
        uploader: info["uploader"].as_str().map(str::to_string),
        thumbnail_url: info["thumbnail"].as_str().map(str::to_string),
        source_url: Some(url.to_string()),
    }
}

/// Map a yt-dlp failure transcript to a typed error.
fn classify_failure(stderr: &str, url: &str) -> VidsubError {
    let lower = stderr.to_lowercase();
    if lower.contains("sign in to confirm") || lower.contains("not a bot") || lower.contains("captcha") {
        VidsubError::BotChallenge
    } else if lower.contains("not available in your country")
        || lower.contains("geo restriction")
        || lower.contains("geo-restricted")
    {
        VidsubError::GeoBlock(url.to_string())
    } else if lower.contains("video unavailable")
        || lower.contains("404")
        || lower.contains("does not exist")
        || lower.contains("private video")
    {
        VidsubError::NotFound(url.to_string())
    } else if lower.contains("unsupported url") {
        VidsubError::UnsupportedUrl(url.to_string())
    } else {
        VidsubError::Network(first_error_line(stderr))
    }
}

fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .find(|l| l.contains("ERROR"))
        .unwrap_or("download failed")
        .to_string()
}

async fn find_downloaded_file(dest_dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dest_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path
            .file_stem()
            .map(|s| s.to_string_lossy().starts_with("source"))
            .unwrap_or(false)
            && path.extension().map(|e| e != "part").unwrap_or(false)
        {
            return Ok(path);
        }
    }
    Err(VidsubError::Network(
        "download finished but no output file found".to_string(),
    ))
}
