pub mod registry;
pub mod token;

pub use registry::TaskRegistry;
pub use token::{DownloadGuard, TokenVerification};

use crate::error::TaskError;
use crate::media::{MediaMetadata, WatermarkSpec};
use crate::transcribe::WhisperModel;
use crate::translate::TranslatorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Upload,
    FetchAndProcess,
    FetchOnly,
    Cut,
    Merge,
    Embed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// User-selected processing options. The recognized set is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choices {
    /// BCP-47 code or "auto".
    pub source_lang: String,
    pub target_lang: String,
    pub create_burned_video: bool,
    pub transcription_model: WhisperModel,
    pub translator_backend: TranslatorKind,
    pub watermark: Option<WatermarkSpec>,
    pub transcription_only: bool,
}

impl Default for Choices {
    fn default() -> Self {
        Self {
            source_lang: "auto".to_string(),
            target_lang: "en".to_string(),
            create_burned_video: false,
            transcription_model: WhisperModel::default(),
            translator_backend: TranslatorKind::default(),
            watermark: None,
            transcription_only: false,
        }
    }
}

impl Choices {
    /// The identity pair needs no provider round trips.
    pub fn is_identity_translation(&self) -> bool {
        self.source_lang != "auto" && self.source_lang == self.target_lang
    }

    /// Whether the task translates through a provider at all.
    pub fn wants_translation(&self) -> bool {
        !self.transcription_only && !self.is_identity_translation()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Source,
    Audio,
    OriginalSubtitles,
    TranslatedSubtitles,
    FinalVideo,
    Summary,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::Audio => "audio",
            ArtifactKind::OriginalSubtitles => "original_subtitles",
            ArtifactKind::TranslatedSubtitles => "translated_subtitles",
            ArtifactKind::FinalVideo => "final_video",
            ArtifactKind::Summary => "summary",
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(ArtifactKind::Source),
            "audio" => Ok(ArtifactKind::Audio),
            "original_subtitles" => Ok(ArtifactKind::OriginalSubtitles),
            "translated_subtitles" => Ok(ArtifactKind::TranslatedSubtitles),
            "final_video" => Ok(ArtifactKind::FinalVideo),
            "summary" => Ok(ArtifactKind::Summary),
            _ => Err(format!("unknown artifact kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub artifacts: HashMap<ArtifactKind, PathBuf>,
    pub detected_language: Option<String>,
    /// Wall-clock seconds per step.
    pub timing: HashMap<String, f64>,
    pub media_metadata: Option<MediaMetadata>,
}

impl TaskResult {
    pub fn empty() -> Self {
        Self {
            artifacts: HashMap::new(),
            detected_language: None,
            timing: HashMap::new(),
            media_metadata: None,
        }
    }
}

/// Durable view of a task, written to `meta.json` on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub choices: Choices,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_metadata: Option<MediaMetadata>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_identity_translation() {
        let mut choices = Choices::default();
        choices.source_lang = "en".to_string();
        choices.target_lang = "en".to_string();
        assert!(choices.is_identity_translation());
        assert!(!choices.wants_translation());

        choices.source_lang = "auto".to_string();
        assert!(!choices.is_identity_translation());
        assert!(choices.wants_translation());
    }

    #[test]
    fn test_transcription_only_skips_translation() {
        let mut choices = Choices::default();
        choices.transcription_only = true;
        assert!(!choices.wants_translation());
    }

    #[test]
    fn test_artifact_kind_round_trip() {
        for kind in [
            ArtifactKind::Source,
            ArtifactKind::Audio,
            ArtifactKind::OriginalSubtitles,
            ArtifactKind::TranslatedSubtitles,
            ArtifactKind::FinalVideo,
            ArtifactKind::Summary,
        ] {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = TaskSnapshot {
            task_id: "abc".to_string(),
            kind: TaskKind::Upload,
            state: TaskState::Pending,
            choices: Choices::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            source_metadata: None,
            result: None,
            error: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"pending\""));
        let back: TaskSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, "abc");
    }
}
