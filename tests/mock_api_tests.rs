//! HTTP-level tests for the provider clients, using wiremock so no real
//! endpoints or API keys are involved.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vidsub::error::VidsubError;
use vidsub::subtitle::Segment;
use vidsub::summary::SummaryHook;
use vidsub::translate::{LlmTranslator, SimpleTranslator, TranslateBackend};

fn make_segments(count: usize) -> Vec<Segment> {
    (0..count)
        .map(|i| {
            Segment::new(
                i,
                Duration::from_millis(i as u64 * 1000),
                Duration::from_millis(i as u64 * 1000 + 900),
                format!("line {i}"),
            )
        })
        .collect()
}

/// Wrap text in the generateContent response shape.
fn llm_body(text: &str) -> serde_json::Value {
    json!({
        "candidates": [
            { "content": { "parts": [ { "text": text } ] } }
        ]
    })
}

const LLM_PATH: &str = "/models/gemini-2.0-flash:generateContent";

// ============================================================================
// Batched LLM translator
// ============================================================================

mod llm_tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_batch_single_call() {
        let server = MockServer::start().await;
        let body = "[0] cero\n[1] uno\n[2] dos\n###END###";
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(body)))
            .expect(1)
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string()).with_base_url(server.uri());
        let result = translator
            .translate_batch(&make_segments(3), "en", "es")
            .await
            .unwrap();

        assert_eq!(result.texts, vec!["cero", "uno", "dos"]);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_indices_recovered_on_retry() {
        let server = MockServer::start().await;

        // First call: only the first half arrives.
        let first = (0..10)
            .map(|i| format!("[{i}] t{i}\n"))
            .collect::<String>()
            + "###END###";
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&first)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        // Second call: the missing half.
        let second = (10..20)
            .map(|i| format!("[{i}] t{i}\n"))
            .collect::<String>()
            + "###END###";
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&second)))
            .expect(1)
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string()).with_base_url(server.uri());
        let result = translator
            .translate_batch(&make_segments(20), "en", "es")
            .await
            .unwrap();

        assert_eq!(result.retry_count, 1);
        assert_eq!(result.texts.len(), 20);
        for (i, text) in result.texts.iter().enumerate() {
            assert_eq!(text, &format!("t{i}"));
        }
    }

    #[tokio::test]
    async fn test_truncated_response_triggers_reissue() {
        let server = MockServer::start().await;

        // No sentinel: the last line is discarded as possibly cut off.
        let truncated = (0..5).map(|i| format!("[{i}] t{i}\n")).collect::<String>();
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&truncated)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(llm_body("[4] t4\n###END###")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string()).with_base_url(server.uri());
        let result = translator
            .translate_batch(&make_segments(5), "en", "es")
            .await
            .unwrap();

        assert_eq!(result.retry_count, 1);
        assert_eq!(result.texts[4], "t4");
    }

    #[tokio::test]
    async fn test_unresolvable_index_fails_with_missing_set() {
        let server = MockServer::start().await;

        // Index 7 never shows up, no matter how often we ask.
        let body = (0..10)
            .filter(|i| *i != 7)
            .map(|i| format!("[{i}] t{i}\n"))
            .collect::<String>()
            + "###END###";
        // Retry cap: initial call + max_retries re-issues, never more.
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(&body)))
            .expect(3)
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string())
            .with_base_url(server.uri())
            .with_max_retries(2);
        let result = translator
            .translate_batch(&make_segments(10), "en", "es")
            .await;

        match result {
            Err(VidsubError::TranslationIncomplete { missing }) => {
                assert_eq!(missing, vec![7]);
            }
            other => panic!("expected TranslationIncomplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_requests_only_missing_indices() {
        let server = MockServer::start().await;

        let first = "[0] a\n[1] b\n###END###";
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body(first)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        // The re-issue must contain only the unresolved line.
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .and(body_string_contains("[2]"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(llm_body("[2] c\n###END###")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string()).with_base_url(server.uri());
        let result = translator
            .translate_batch(&make_segments(3), "en", "es")
            .await
            .unwrap();

        assert_eq!(result.texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let translator = LlmTranslator::new("key".to_string()).with_base_url(server.uri());
        let result = translator.translate_batch(&make_segments(2), "en", "es").await;

        match result {
            Err(e) => assert!(e.is_transient(), "expected transient error, got {e}"),
            Ok(_) => panic!("expected error"),
        }
    }
}

// ============================================================================
// Simple per-string translator
// ============================================================================

mod simple_tests {
    use super::*;

    #[tokio::test]
    async fn test_translates_each_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"translatedText": "hola"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let translator = SimpleTranslator::new(server.uri(), None);
        let result = translator
            .translate_batch(&make_segments(3), "en", "es")
            .await
            .unwrap();

        assert_eq!(result.texts, vec!["hola", "hola", "hola"]);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn test_backs_off_on_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"translatedText": "bonjour"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let translator = SimpleTranslator::new(server.uri(), None);
        let started = std::time::Instant::now();
        let result = translator.translate_one("hello", "en", "fr").await.unwrap();

        assert_eq!(result, "bonjour");
        // Two backoff sleeps: 500 ms then 1000 ms.
        assert!(started.elapsed() >= Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad language pair"))
            .expect(1)
            .mount(&server)
            .await;

        let translator = SimpleTranslator::new(server.uri(), None);
        let result = translator.translate_one("hello", "en", "xx").await;
        assert!(matches!(result, Err(VidsubError::InvalidInput(_))));
    }
}

// ============================================================================
// Summary hook
// ============================================================================

mod summary_tests {
    use super::*;

    fn write_srt(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("translated.srt");
        std::fs::write(
            &path,
            "1\n00:00:00,000 --> 00:00:02,000\nWelcome to the show\n\n\
             2\n00:00:02,000 --> 00:00:04,000\nToday we build things\n",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_summarizes_subtitles_as_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .and(body_string_contains("Welcome to the show"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(llm_body("# Summary\n\n- things get built")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let srt = write_srt(&dir);

        let hook = SummaryHook::new("key".to_string(), 1500).with_base_url(server.uri());
        let markdown = hook.summarize(&srt, "en", None).await.unwrap();
        assert!(markdown.starts_with("# Summary"));
    }

    #[tokio::test]
    async fn test_custom_prompt_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .and(body_string_contains("focus on the jokes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(llm_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let srt = write_srt(&dir);

        let hook = SummaryHook::new("key".to_string(), 1500).with_base_url(server.uri());
        hook.summarize(&srt, "en", Some("focus on the jokes"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provider_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LLM_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let srt = write_srt(&dir);

        let hook = SummaryHook::new("key".to_string(), 1500).with_base_url(server.uri());
        let result = hook.summarize(&srt, "en", None).await;
        assert!(matches!(result, Err(VidsubError::BackendUnavailable(_))));
    }
}
