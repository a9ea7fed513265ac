use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Final classification of a failure, exposed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedUrl,
    BotChallenge,
    GeoBlock,
    NotFound,
    Network,
    AudioDecodeFailed,
    ModelLoadFailed,
    BackendTimeout,
    BackendUnavailable,
    TranslationIncomplete,
    TranscodeFailed,
    TranscodeTimeout,
    StageTimeout,
    PromptTooLong,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum VidsubError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("The remote source refused automated download")]
    BotChallenge,

    #[error("Content is not available in this region: {0}")]
    GeoBlock(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Audio decode failed: {0}")]
    AudioDecodeFailed(String),

    #[error("Speech model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Translation incomplete; missing segment indices {missing:?}")]
    TranslationIncomplete { missing: Vec<usize> },

    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("Transcode timed out after {seconds}s")]
    TranscodeTimeout { seconds: u64 },

    #[error("Stage {stage} timed out after {seconds}s")]
    StageTimeout { stage: String, seconds: u64 },

    #[error("Prompt too long: {len} chars (max {max})")]
    PromptTooLong { len: usize, max: usize },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VidsubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VidsubError::InvalidInput(_) | VidsubError::Config(_) => ErrorKind::InvalidInput,
            VidsubError::UnsupportedUrl(_) => ErrorKind::UnsupportedUrl,
            VidsubError::BotChallenge => ErrorKind::BotChallenge,
            VidsubError::GeoBlock(_) => ErrorKind::GeoBlock,
            VidsubError::NotFound(_) => ErrorKind::NotFound,
            VidsubError::Network(_) => ErrorKind::Network,
            VidsubError::AudioDecodeFailed(_) => ErrorKind::AudioDecodeFailed,
            VidsubError::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            VidsubError::BackendTimeout(_) => ErrorKind::BackendTimeout,
            VidsubError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            VidsubError::TranslationIncomplete { .. } => ErrorKind::TranslationIncomplete,
            VidsubError::TranscodeFailed(_) => ErrorKind::TranscodeFailed,
            VidsubError::TranscodeTimeout { .. } => ErrorKind::TranscodeTimeout,
            VidsubError::StageTimeout { .. } => ErrorKind::StageTimeout,
            VidsubError::PromptTooLong { .. } => ErrorKind::PromptTooLong,
            VidsubError::Cancelled => ErrorKind::Cancelled,
            VidsubError::Http(e) => {
                if e.is_timeout() {
                    ErrorKind::BackendTimeout
                } else {
                    ErrorKind::Network
                }
            }
            VidsubError::Io(_) | VidsubError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the failing operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::BackendTimeout | ErrorKind::BackendUnavailable
        )
    }

    /// Message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            VidsubError::BotChallenge => {
                "The source site refused the automated download. Please download the file \
                 yourself and upload it instead."
                    .to_string()
            }
            VidsubError::GeoBlock(_) => {
                "This content is not available from the server's region.".to_string()
            }
            VidsubError::NotFound(_) => "The requested media could not be found.".to_string(),
            VidsubError::TranslationIncomplete { missing } => format!(
                "Translation could not be completed ({} segments unresolved).",
                missing.len()
            ),
            VidsubError::PromptTooLong { len, max } => {
                format!("The summary prompt is too long ({len} of {max} characters).")
            }
            VidsubError::Cancelled => "The task was cancelled.".to_string(),
            VidsubError::InvalidInput(msg) | VidsubError::Config(msg) => msg.clone(),
            other => match other.kind() {
                ErrorKind::Network | ErrorKind::BackendTimeout | ErrorKind::BackendUnavailable => {
                    "A temporary provider error prevented the task from completing.".to_string()
                }
                ErrorKind::TranscodeFailed | ErrorKind::TranscodeTimeout => {
                    "Media processing failed.".to_string()
                }
                _ => "The task failed due to an internal error.".to_string(),
            },
        }
    }
}

/// Terminal failure record attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub user_facing_message: String,
    pub detail: String,
    pub recoverable: bool,
    pub retry_after_ms: Option<u64>,
}

impl TaskError {
    pub fn from_error(err: &VidsubError) -> Self {
        Self {
            kind: err.kind(),
            user_facing_message: err.user_message(),
            detail: err.to_string(),
            recoverable: err.is_transient(),
            retry_after_ms: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VidsubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(VidsubError::BotChallenge.kind(), ErrorKind::BotChallenge);
        assert_eq!(
            VidsubError::TranslationIncomplete { missing: vec![7] }.kind(),
            ErrorKind::TranslationIncomplete
        );
        assert_eq!(
            VidsubError::Config("bad".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(VidsubError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_transient_classification() {
        assert!(VidsubError::Network("reset".into()).is_transient());
        assert!(VidsubError::BackendTimeout("slow".into()).is_transient());
        assert!(!VidsubError::BotChallenge.is_transient());
        assert!(!VidsubError::InvalidInput("x".into()).is_transient());
    }

    #[test]
    fn test_bot_challenge_message_mentions_upload() {
        let msg = VidsubError::BotChallenge.user_message();
        assert!(msg.contains("upload"));
    }

    #[test]
    fn test_task_error_from_error() {
        let err = VidsubError::TranslationIncomplete { missing: vec![7] };
        let task_err = TaskError::from_error(&err);
        assert_eq!(task_err.kind, ErrorKind::TranslationIncomplete);
        assert!(!task_err.recoverable);
        assert!(task_err.detail.contains("[7]"));
    }
}
