pub mod llm;
pub mod simple;

pub use llm::LlmTranslator;
pub use simple::SimpleTranslator;

use crate::config::Config;
use crate::error::{Result, VidsubError};
use crate::subtitle::Segment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of one batch translation call.
#[derive(Debug, Clone)]
pub struct BatchTranslation {
    /// One translation per input segment, in input order.
    pub texts: Vec<String>,
    /// Re-issues needed to resolve missing indices.
    pub retry_count: u32,
}

/// Capability set shared by translation backends. Backends must preserve
/// ordering and count: `texts[i]` is the translation of `segments[i]`.
#[async_trait]
pub trait TranslateBackend: Send + Sync {
    async fn translate_batch(
        &self,
        segments: &[Segment],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<BatchTranslation>;

    async fn translate_one(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String>;

    fn name(&self) -> &'static str;
}

/// Which backend a task uses; resolved once at task creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslatorKind {
    Simple,
    #[default]
    Llm,
}

impl std::str::FromStr for TranslatorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(TranslatorKind::Simple),
            "llm" => Ok(TranslatorKind::Llm),
            _ => Err(format!("Unknown translator backend: {s}. Use 'simple' or 'llm'")),
        }
    }
}

impl std::fmt::Display for TranslatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslatorKind::Simple => write!(f, "simple"),
            TranslatorKind::Llm => write!(f, "llm"),
        }
    }
}

/// Build the backend selected in the task choices.
pub fn create_translator(kind: TranslatorKind, config: &Config) -> Result<Arc<dyn TranslateBackend>> {
    match kind {
        TranslatorKind::Simple => {
            let url = config.translate_api_url.as_ref().ok_or_else(|| {
                VidsubError::Config(
                    "Simple translator endpoint not set. Set VIDSUB_TRANSLATE_API_URL.".to_string(),
                )
            })?;
            Ok(Arc::new(SimpleTranslator::new(
                url.clone(),
                config.translate_api_key.clone(),
            )))
        }
        TranslatorKind::Llm => {
            let key = config.llm_api_key.as_ref().ok_or_else(|| {
                VidsubError::Config(
                    "LLM API key not set. Set VIDSUB_LLM_API_KEY.".to_string(),
                )
            })?;
            Ok(Arc::new(
                LlmTranslator::new(key.clone()).with_max_retries(config.max_translation_retries),
            ))
        }
    }
}

/// Convert language code to human-readable name for better prompting.
pub(crate) fn language_name(code: &str) -> &'static str {
    let lowercase = code.to_lowercase();
    match lowercase.as_str() {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "id" => "Indonesian",
        "ms" => "Malay",
        "tl" => "Tagalog",
        "nl" => "Dutch",
        "pl" => "Polish",
        "tr" => "Turkish",
        "uk" => "Ukrainian",
        "cs" => "Czech",
        "sv" => "Swedish",
        "da" => "Danish",
        "fi" => "Finnish",
        "no" => "Norwegian",
        "el" => "Greek",
        "he" => "Hebrew",
        "hu" => "Hungarian",
        "ro" => "Romanian",
        "bg" => "Bulgarian",
        "hr" => "Croatian",
        "sk" => "Slovak",
        "sl" => "Slovenian",
        "lt" => "Lithuanian",
        "lv" => "Latvian",
        "et" => "Estonian",
        _ => "the target language",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translator_kind_parsing() {
        assert_eq!("simple".parse::<TranslatorKind>().unwrap(), TranslatorKind::Simple);
        assert_eq!("LLM".parse::<TranslatorKind>().unwrap(), TranslatorKind::Llm);
        assert!("deepl".parse::<TranslatorKind>().is_err());
    }

    #[test]
    fn test_create_translator_requires_credentials() {
        let config = Config::default();
        assert!(create_translator(TranslatorKind::Llm, &config).is_err());
        assert!(create_translator(TranslatorKind::Simple, &config).is_err());
    }

    #[test]
    fn test_create_translator_with_credentials() {
        let mut config = Config::default();
        config.llm_api_key = Some("test-key".to_string());
        let translator = create_translator(TranslatorKind::Llm, &config).unwrap();
        assert_eq!(translator.name(), "llm");

        config.translate_api_url = Some("http://localhost:5000".to_string());
        let translator = create_translator(TranslatorKind::Simple, &config).unwrap();
        assert_eq!(translator.name(), "simple");
    }

    #[test]
    fn test_language_name() {
        assert_eq!(language_name("en"), "English");
        assert_eq!(language_name("JA"), "Japanese");
        assert_eq!(language_name("xyz"), "the target language");
    }
}
