//! Post-success summary hook.
//!
//! Turns a translated subtitle file into a markdown summary with a single
//! LLM call. Runs after terminal success only; never part of the pipeline
//! timing budget.

use crate::error::{Result, VidsubError};
use crate::subtitle;
use crate::translate::language_name;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct SummaryHook {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_prompt_chars: usize,
}

impl SummaryHook {
    pub fn new(api_key: String, max_prompt_chars: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_prompt_chars,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different API host. Used by tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Summarize a subtitle file as markdown in `summary_lang`.
    pub async fn summarize(
        &self,
        subtitle_path: &Path,
        summary_lang: &str,
        custom_prompt: Option<&str>,
    ) -> Result<String> {
        if let Some(prompt) = custom_prompt {
            let len = prompt.chars().count();
            if len > self.max_prompt_chars {
                return Err(VidsubError::PromptTooLong {
                    len,
                    max: self.max_prompt_chars,
                });
            }
        }

        let content = tokio::fs::read_to_string(subtitle_path).await?;
        let segments = subtitle::parse(&content)?;
        if segments.is_empty() {
            return Err(VidsubError::InvalidInput(
                "subtitle file contains no cues to summarize".to_string(),
            ));
        }
        let transcript: String = segments
            .iter()
            .map(|s| s.text.replace('\n', " "))
            .collect::<Vec<_>>()
            .join("\n");

        let language = language_name(summary_lang);
        let mut prompt = format!(
            "Summarize the following video transcript in {language}. \
             Answer in markdown with a short paragraph followed by key points.\n"
        );
        if let Some(custom) = custom_prompt {
            prompt.push_str("Additional instructions: ");
            prompt.push_str(custom);
            prompt.push('\n');
        }
        prompt.push_str("\nTranscript:\n");
        prompt.push_str(&transcript);

        debug!(
            "summarizing {} cues ({} chars of transcript)",
            segments.len(),
            transcript.len()
        );
        self.call_api(prompt).await
    }

    async fn call_api(&self, prompt: String) -> Result<String> {
        let request = SummaryRequest {
            contents: vec![SummaryContent {
                parts: vec![SummaryPart { text: prompt }],
            }],
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(VidsubError::BackendUnavailable(format!(
                "summary provider error ({status}): {body}"
            )));
        }

        let parsed: SummaryResponse = serde_json::from_str(&body)?;
        let markdown = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|p| p.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();

        if markdown.trim().is_empty() {
            return Err(VidsubError::BackendUnavailable(
                "summary provider returned an empty response".to_string(),
            ));
        }
        Ok(markdown.trim().to_string())
    }
}

#[derive(Serialize)]
struct SummaryRequest {
    contents: Vec<SummaryContent>,
}

#[derive(Serialize)]
struct SummaryContent {
    parts: Vec<SummaryPart>,
}

#[derive(Serialize)]
struct SummaryPart {
    text: String,
}

#[derive(Deserialize)]
struct SummaryResponse {
    candidates: Option<Vec<SummaryCandidate>>,
}

#[derive(Deserialize)]
struct SummaryCandidate {
    content: Option<SummaryResponseContent>,
}

#[derive(Deserialize)]
struct SummaryResponseContent {
    parts: Option<Vec<SummaryResponsePart>>,
}

#[derive(Deserialize)]
struct SummaryResponsePart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prompt_over_limit_rejected() {
        let hook = SummaryHook::new("key".to_string(), 10);
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("t.srt");
        std::fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nHi\n").unwrap();

        let long_prompt = "x".repeat(11);
        let result = hook.summarize(&srt, "en", Some(&long_prompt)).await;
        assert!(matches!(
            result,
            Err(VidsubError::PromptTooLong { len: 11, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_prompt_at_limit_passes_gate() {
        // Points at an unreachable host, so reaching the HTTP error proves
        // the length gate let it through.
        let hook = SummaryHook::new("key".to_string(), 10)
            .with_base_url("http://127.0.0.1:1");
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("t.srt");
        std::fs::write(&srt, "1\n00:00:00,000 --> 00:00:01,000\nHi\n").unwrap();

        let prompt = "x".repeat(10);
        let result = hook.summarize(&srt, "en", Some(&prompt)).await;
        assert!(!matches!(result, Err(VidsubError::PromptTooLong { .. })));
    }

    #[tokio::test]
    async fn test_empty_subtitles_rejected() {
        let hook = SummaryHook::new("key".to_string(), 1500);
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("empty.srt");
        std::fs::write(&srt, "").unwrap();

        let result = hook.summarize(&srt, "en", None).await;
        assert!(matches!(result, Err(VidsubError::InvalidInput(_))));
    }
}
