pub mod whisper;

pub use whisper::WhisperCppBackend;

use crate::error::Result;
use crate::subtitle::Segment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Speech model size selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhisperModel {
    Tiny,
    #[default]
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhisperModel::Tiny => "tiny",
            WhisperModel::Base => "base",
            WhisperModel::Small => "small",
            WhisperModel::Medium => "medium",
            WhisperModel::Large => "large",
        }
    }

    /// Model weight file name in the model directory.
    pub fn file_name(&self) -> String {
        format!("ggml-{}.bin", self.as_str())
    }
}

impl std::fmt::Display for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WhisperModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperModel::Tiny),
            "base" => Ok(WhisperModel::Base),
            "small" => Ok(WhisperModel::Small),
            "medium" => Ok(WhisperModel::Medium),
            "large" => Ok(WhisperModel::Large),
            _ => Err(format!(
                "Unknown model: {s}. Use 'tiny', 'base', 'small', 'medium' or 'large'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub model: WhisperModel,
    /// ISO language code; `None` means auto-detect.
    pub source_lang: Option<String>,
    /// Wall-clock ceiling for the whole run; enforced by the backend so it
    /// can kill its own subprocess group.
    pub time_limit: Option<Duration>,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            model: WhisperModel::default(),
            source_lang: None,
            time_limit: None,
        }
    }
}

/// Trait for speech-to-text backends.
///
/// Implementations emit segments in chronological order with dense indices
/// from 0 into `tx`, and resolve to the detected source language once the
/// audio is fully processed. Sends on the bounded channel are the
/// suspension points that let downstream stages overlap with
/// transcription.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        opts: &TranscribeOptions,
        tx: mpsc::Sender<Segment>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    fn name(&self) -> &'static str;
}
