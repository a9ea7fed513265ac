use crate::error::{Result, VidsubError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_translation_parallelism() -> usize {
    4
}
fn default_provider_permits() -> usize {
    8
}
fn default_transcription_parallelism() -> usize {
    1
}
fn default_batch_size() -> usize {
    20
}
fn default_translation_retries() -> u32 {
    2
}
fn default_task_ttl_seconds() -> u64 {
    3600
}
fn default_max_cut_seconds() -> u64 {
    14_400
}
fn default_summary_prompt_max_chars() -> usize {
    1500
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("vidsub")
}
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}
fn default_ytdlp() -> String {
    "yt-dlp".to_string()
}
fn default_whisper() -> String {
    "whisper-cli".to_string()
}
fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vidsub")
        .join("models")
}

/// Runtime configuration. The recognized option set is closed; unknown
/// environment variables are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool size for translation batches.
    #[serde(default = "default_translation_parallelism")]
    pub translation_parallelism: usize,
    /// Global permits for outbound provider calls, shared across tasks.
    #[serde(default = "default_provider_permits")]
    pub max_concurrent_provider_requests: usize,
    /// Concurrent transcription runs (speech model contention).
    #[serde(default = "default_transcription_parallelism")]
    pub transcription_parallelism: usize,
    /// Segments per translation batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Re-issues per batch for missing translation indices.
    #[serde(default = "default_translation_retries")]
    pub max_translation_retries: u32,
    /// Seconds past terminal transition before a task and its artifacts
    /// are garbage-collected.
    #[serde(default = "default_task_ttl_seconds")]
    pub task_ttl_seconds: u64,
    /// Longest span a cut operation accepts.
    #[serde(default = "default_max_cut_seconds")]
    pub max_cut_seconds: u64,
    /// Cap on user-supplied summary prompts.
    #[serde(default = "default_summary_prompt_max_chars")]
    pub summary_prompt_max_chars: usize,
    /// Root under which per-task artifact directories are created.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Task worker pool size.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: String,
    #[serde(default = "default_ytdlp")]
    pub ytdlp_path: String,
    #[serde(default = "default_whisper")]
    pub whisper_path: String,
    #[serde(default = "default_model_dir")]
    pub whisper_model_dir: PathBuf,

    /// Simple translation backend endpoint (LibreTranslate-compatible).
    #[serde(default)]
    pub translate_api_url: Option<String>,
    #[serde(default)]
    pub translate_api_key: Option<String>,
    /// LLM provider key (batched translation and summaries).
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Secret for signing download tokens. Generated per process when unset.
    #[serde(default)]
    pub download_token_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            translation_parallelism: default_translation_parallelism(),
            max_concurrent_provider_requests: default_provider_permits(),
            transcription_parallelism: default_transcription_parallelism(),
            batch_size: default_batch_size(),
            max_translation_retries: default_translation_retries(),
            task_ttl_seconds: default_task_ttl_seconds(),
            max_cut_seconds: default_max_cut_seconds(),
            summary_prompt_max_chars: default_summary_prompt_max_chars(),
            work_dir: default_work_dir(),
            worker_count: default_worker_count(),
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            ytdlp_path: default_ytdlp(),
            whisper_path: default_whisper(),
            whisper_model_dir: default_model_dir(),
            translate_api_url: None,
            translate_api_key: None,
            llm_api_key: None,
            download_token_secret: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if it exists
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                match toml::from_str::<Config>(&contents) {
                    Ok(file_config) => config = file_config,
                    Err(e) => {
                        return Err(VidsubError::Config(format!(
                            "Failed to parse {}: {e}",
                            config_path.display()
                        )))
                    }
                }
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Override file/default values with environment variables.
    fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = env_parse("VIDSUB_TRANSLATION_PARALLELISM") {
            self.translation_parallelism = v;
        }
        if let Some(v) = env_parse("VIDSUB_MAX_CONCURRENT_PROVIDER_REQUESTS") {
            self.max_concurrent_provider_requests = v;
        }
        if let Some(v) = env_parse("VIDSUB_TRANSCRIPTION_PARALLELISM") {
            self.transcription_parallelism = v;
        }
        if let Some(v) = env_parse("VIDSUB_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("VIDSUB_MAX_TRANSLATION_RETRIES") {
            self.max_translation_retries = v;
        }
        if let Some(v) = env_parse("VIDSUB_TASK_TTL_SECONDS") {
            self.task_ttl_seconds = v;
        }
        if let Some(v) = env_parse("VIDSUB_MAX_CUT_SECONDS") {
            self.max_cut_seconds = v;
        }
        if let Some(v) = env_parse("VIDSUB_SUMMARY_PROMPT_MAX_CHARS") {
            self.summary_prompt_max_chars = v;
        }
        if let Ok(v) = std::env::var("VIDSUB_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VIDSUB_TRANSLATE_API_URL") {
            self.translate_api_url = Some(v);
        }
        if let Ok(v) = std::env::var("VIDSUB_TRANSLATE_API_KEY") {
            self.translate_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VIDSUB_LLM_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VIDSUB_DOWNLOAD_TOKEN_SECRET") {
            self.download_token_secret = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.translation_parallelism == 0 {
            return Err(VidsubError::Config(
                "translation_parallelism must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_provider_requests == 0 {
            return Err(VidsubError::Config(
                "max_concurrent_provider_requests must be at least 1".to_string(),
            ));
        }
        if self.transcription_parallelism == 0 {
            return Err(VidsubError::Config(
                "transcription_parallelism must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(VidsubError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(VidsubError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective translation worker pool size: never above the global
    /// provider permit count.
    pub fn effective_translation_parallelism(&self) -> usize {
        self.translation_parallelism
            .min(self.max_concurrent_provider_requests)
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vidsub").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_translation_retries, 2);
        assert_eq!(config.task_ttl_seconds, 3600);
        assert_eq!(config.max_cut_seconds, 14_400);
        assert_eq!(config.summary_prompt_max_chars, 1500);
        assert_eq!(config.transcription_parallelism, 1);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let mut config = Config::default();
        config.translation_parallelism = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_parallelism_capped_by_permits() {
        let mut config = Config::default();
        config.translation_parallelism = 16;
        config.max_concurrent_provider_requests = 4;
        assert_eq!(config.effective_translation_parallelism(), 4);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("batch_size = 5").unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_translation_retries, 2);
    }
}
