//! Batched LLM translation.
//!
//! Each batch call sends numbered segments plus an end sentinel the model
//! must echo. A response without the sentinel is treated as truncated.
//! Missing indices are re-requested (only those indices) up to the retry
//! cap; leftover gaps fail the batch with the missing set attached.

use crate::error::{Result, VidsubError};
use crate::subtitle::Segment;
use crate::translate::{language_name, BatchTranslation, TranslateBackend};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Token the model must echo as its final line to signal a complete
/// response.
pub const END_SENTINEL: &str = "###END###";

pub struct LlmTranslator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
}

impl LlmTranslator {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: 2,
        }
    }

    /// Set a different model (e.g., "gemini-1.5-pro").
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different API host. Used by tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn build_batch_prompt(
        &self,
        numbered: &[(usize, &str)],
        source_lang: &str,
        target_lang: &str,
    ) -> String {
        let target = language_name(target_lang);
        let origin = if source_lang == "auto" {
            String::new()
        } else {
            format!(" from {}", language_name(source_lang))
        };

        let lines: String = numbered
            .iter()
            .map(|(i, t)| format!("[{i}] {}\n", t.replace('\n', " ")))
            .collect();

        format!(
            "Translate the following numbered subtitle lines{origin} to {target}.\n\
             Reply with exactly one line per input in the form `[n] translation`, keeping \
             the same numbers, then finish with {END_SENTINEL} on its own line.\n\n\
             {lines}"
        )
    }

    /// Extract `[n] text` lines for the requested indices. Returns the
    /// parsed map and whether the sentinel was present. Without the
    /// sentinel the response counts as truncated and the last matched
    /// line is discarded, since it may have been cut off mid-text.
    fn parse_batch_response(response: &str, wanted: &[usize]) -> (BTreeMap<usize, String>, bool) {
        let complete = response.contains(END_SENTINEL);
        let line_re = Regex::new(r"^\s*\[(\d+)\]\s*(.*)$").expect("static regex");

        let mut found = BTreeMap::new();
        let mut last_matched = None;
        for line in response.lines() {
            if line.contains(END_SENTINEL) {
                break;
            }
            if let Some(caps) = line_re.captures(line) {
                if let Ok(index) = caps[1].parse::<usize>() {
                    let text = caps[2].trim();
                    if wanted.contains(&index) && !text.is_empty() {
                        found.insert(index, text.to_string());
                        last_matched = Some(index);
                    }
                }
            }
        }
        if !complete {
            if let Some(index) = last_matched {
                found.remove(&index);
            }
        }
        (found, complete)
    }

    async fn call_api(&self, prompt: String) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart { text: prompt }],
            }],
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VidsubError::BackendUnavailable(format!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(VidsubError::BackendUnavailable(format!(
                "provider error ({status}): {body}"
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)?;
        if let Some(error) = parsed.error {
            return Err(VidsubError::BackendUnavailable(error.message));
        }

        Ok(parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|p| p.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default())
    }
}

#[async_trait]
impl TranslateBackend for LlmTranslator {
    async fn translate_batch(
        &self,
        segments: &[Segment],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<BatchTranslation> {
        if segments.is_empty() {
            return Ok(BatchTranslation {
                texts: Vec::new(),
                retry_count: 0,
            });
        }

        let mut resolved: BTreeMap<usize, String> = BTreeMap::new();
        let mut missing: Vec<usize> = segments.iter().map(|s| s.index).collect();
        let mut retry_count = 0u32;

        loop {
            let numbered: Vec<(usize, &str)> = segments
                .iter()
                .filter(|s| missing.contains(&s.index))
                .map(|s| (s.index, s.text.as_str()))
                .collect();

            debug!(
                "translating {} segment(s) ({} previously resolved)",
                numbered.len(),
                resolved.len()
            );

            let prompt = self.build_batch_prompt(&numbered, source_lang, target_lang);
            let response = self.call_api(prompt).await?;
            let (found, complete) = Self::parse_batch_response(&response, &missing);

            if !complete {
                warn!("response missing end sentinel, treating as truncated");
            }
            resolved.extend(found);
            missing.retain(|i| !resolved.contains_key(i));

            if missing.is_empty() {
                break;
            }
            if retry_count >= self.max_retries {
                return Err(VidsubError::TranslationIncomplete { missing });
            }
            retry_count += 1;
            warn!(
                "re-requesting {} missing indices (attempt {retry_count})",
                missing.len()
            );
        }

        let texts = segments
            .iter()
            .map(|s| resolved.remove(&s.index).unwrap_or_default())
            .collect();
        Ok(BatchTranslation { texts, retry_count })
    }

    async fn translate_one(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String> {
        let source = language_name(source_lang);
        let target = language_name(target_lang);
        let prompt = format!(
            "Translate the following text from {source} to {target}. \
             Return ONLY the translated text.\n\n{text}"
        );
        let response = self.call_api(prompt).await?;
        Ok(response.trim().to_string())
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
}

#[derive(Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<ResponseCandidate>>,
    error: Option<ResponseError>,
}

#[derive(Deserialize, Debug)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_batch_prompt() {
        let translator = LlmTranslator::new("test-key".to_string());
        let prompt = translator.build_batch_prompt(
            &[(0, "Hello"), (1, "Multi\nline")],
            "en",
            "es",
        );
        assert!(prompt.contains("English"));
        assert!(prompt.contains("Spanish"));
        assert!(prompt.contains("[0] Hello"));
        assert!(prompt.contains("[1] Multi line"));
        assert!(prompt.contains(END_SENTINEL));
    }

    #[test]
    fn test_parse_complete_response() {
        let response = "[0] Hola\n[1] Adiós\n###END###\n";
        let (found, complete) = LlmTranslator::parse_batch_response(response, &[0, 1]);
        assert!(complete);
        assert_eq!(found.len(), 2);
        assert_eq!(found[&0], "Hola");
        assert_eq!(found[&1], "Adiós");
    }

    #[test]
    fn test_parse_truncated_response_discards_last_line() {
        let response = "[0] Hola\n[1] Adi";
        let (found, complete) = LlmTranslator::parse_batch_response(response, &[0, 1, 2]);
        assert!(!complete);
        // [1] may be cut off mid-text, so only [0] survives.
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&0));
        assert!(!found.contains_key(&2));
    }

    #[test]
    fn test_parse_ignores_unrequested_indices() {
        let response = "[0] Hola\n[7] Spurious\n###END###";
        let (found, _) = LlmTranslator::parse_batch_response(response, &[0, 1]);
        assert_eq!(found.len(), 1);
        assert!(!found.contains_key(&7));
    }

    #[test]
    fn test_parse_stops_at_sentinel() {
        let response = "[0] Hola\n###END###\n[1] After sentinel";
        let (found, complete) = LlmTranslator::parse_batch_response(response, &[0, 1]);
        assert!(complete);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let translator = LlmTranslator::new("test-key".to_string());
        let result = translator.translate_batch(&[], "en", "es").await.unwrap();
        assert!(result.texts.is_empty());
        assert_eq!(result.retry_count, 0);
    }

    #[test]
    fn test_builder_overrides() {
        let translator = LlmTranslator::new("k".to_string())
            .with_model("gemini-1.5-pro")
            .with_base_url("http://localhost:1234")
            .with_max_retries(5);
        assert_eq!(translator.model, "gemini-1.5-pro");
        assert_eq!(translator.base_url, "http://localhost:1234");
        assert_eq!(translator.max_retries, 5);
    }
}
