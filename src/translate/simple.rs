//! Per-string translation against a LibreTranslate-compatible endpoint.
//!
//! Deterministic apart from transient provider failures, which are retried
//! with exponential backoff.

use crate::error::{Result, VidsubError};
use crate::subtitle::Segment;
use crate::translate::{BatchTranslation, TranslateBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 8_000;
const MAX_ATTEMPTS: u32 = 5;

pub struct SimpleTranslator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

impl SimpleTranslator {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn call_once(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let request = TranslateRequest {
            q: text,
            source,
            target,
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VidsubError::BackendUnavailable(format!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VidsubError::InvalidInput(format!(
                "translation rejected ({status}): {body}"
            )));
        }

        let parsed: TranslateResponse = response.json().await?;
        Ok(parsed.translated_text)
    }
}

#[async_trait]
impl TranslateBackend for SimpleTranslator {
    async fn translate_batch(
        &self,
        segments: &[Segment],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<BatchTranslation> {
        let mut texts = Vec::with_capacity(segments.len());
        for segment in segments {
            let translated = self
                .translate_one(&segment.text, source_lang, target_lang)
                .await?;
            texts.push(translated);
        }
        Ok(BatchTranslation {
            texts,
            retry_count: 0,
        })
    }

    async fn translate_one(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                debug!("retry attempt {attempt} after {delay}ms");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.call_once(text, source_lang, target_lang).await {
                Ok(translated) => return Ok(translated),
                Err(e) if e.is_transient() => {
                    warn!("attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| VidsubError::BackendUnavailable("translation failed".to_string())))
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}
