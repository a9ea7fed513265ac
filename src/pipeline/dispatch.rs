//! Transcription/translation overlap dispatcher.
//!
//! Consumes the bounded segment channel fed by the speech backend, groups
//! consecutive segments into batches and submits each batch exactly once
//! to a bounded worker pool. Completed batches land in an indexed sink
//! that is read out in batch order once the channel has closed and all
//! submitted batches have finished.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, VidsubError};
use crate::pipeline::progress::{ProgressLedger, StepLabel, StepStatus, StepUpdate};
use crate::subtitle::Segment;
use crate::translate::TranslateBackend;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    /// Worker pool size for translation batches.
    pub parallelism: usize,
    /// Ceiling per batch call; one retry, then the batch fails.
    pub batch_timeout: Duration,
    /// How long in-flight batches get to finish after cancellation.
    pub grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            parallelism: 4,
            batch_timeout: Duration::from_secs(90),
            grace: Duration::from_secs(2),
        }
    }
}

/// What the overlap stage produced.
#[derive(Debug)]
pub struct OverlapOutcome {
    /// Transcribed segments in index order.
    pub segments: Vec<Segment>,
    /// One translation per segment, when a translator ran.
    pub translations: Option<Vec<String>>,
    pub batches: usize,
}

struct BatchDone {
    texts: Vec<String>,
    retry_count: u32,
    duration: Duration,
    inflight: usize,
    expected: usize,
}

type BatchFuture = BoxFuture<'static, (usize, Result<BatchDone>)>;

#[allow(clippy::too_many_arguments)]
fn batch_future(
    batch: Vec<Segment>,
    batch_id: usize,
    translator: Arc<dyn TranslateBackend>,
    source_lang: String,
    target_lang: String,
    workers: Arc<Semaphore>,
    provider_permits: Arc<Semaphore>,
    inflight: Arc<AtomicUsize>,
    timeout: Duration,
) -> BatchFuture {
    Box::pin(async move {
        let _worker = workers.acquire_owned().await.expect("semaphore closed");
        let _permit = provider_permits
            .acquire_owned()
            .await
            .expect("semaphore closed");

        inflight.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let expected = batch.len();
        let mut result = tokio::time::timeout(
            timeout,
            translator.translate_batch(&batch, &source_lang, &target_lang),
        )
        .await;

        // A timed-out batch gets exactly one more attempt.
        if result.is_err() {
            warn!("batch {batch_id} timed out after {}s, retrying once", timeout.as_secs());
            result = tokio::time::timeout(
                timeout,
                translator.translate_batch(&batch, &source_lang, &target_lang),
            )
            .await;
        }

        let observed_inflight = inflight.load(Ordering::SeqCst);
        inflight.fetch_sub(1, Ordering::SeqCst);

        let outcome = match result {
            Err(_) => Err(VidsubError::StageTimeout {
                stage: "translate".to_string(),
                seconds: timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(batch_translation)) => Ok(BatchDone {
                texts: batch_translation.texts,
                retry_count: batch_translation.retry_count,
                duration: started.elapsed(),
                inflight: observed_inflight,
                expected,
            }),
        };
        (batch_id, outcome)
    })
}

/// Drive the overlap stage to completion.
///
/// When `translator` is `None` the channel is drained and segments are
/// collected without translating (transcription-only and identity
/// language pairs).
#[allow(clippy::too_many_arguments)]
pub async fn run_overlap(
    mut rx: mpsc::Receiver<Segment>,
    translator: Option<Arc<dyn TranslateBackend>>,
    source_lang: &str,
    target_lang: &str,
    settings: &DispatchSettings,
    provider_permits: Arc<Semaphore>,
    cancel: &CancellationToken,
    ledger: &ProgressLedger,
    task_id: &str,
    audio_duration: Option<Duration>,
) -> Result<OverlapOutcome> {
    let workers = Arc::new(Semaphore::new(settings.parallelism.max(1)));
    let inflight = Arc::new(AtomicUsize::new(0));

    let mut segments: Vec<Segment> = Vec::new();
    let mut buffer: Vec<Segment> = Vec::new();
    let mut sink: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut pending: FuturesUnordered<BatchFuture> = FuturesUnordered::new();
    let mut submitted = 0usize;
    let mut completed = 0usize;
    let mut channel_open = true;

    let submit = |buffer: &mut Vec<Segment>,
                  pending: &mut FuturesUnordered<BatchFuture>,
                  submitted: &mut usize,
                  translator: &Arc<dyn TranslateBackend>| {
        let batch = std::mem::take(buffer);
        let batch_id = batch[0].index / settings.batch_size;
        debug!("submitting batch {batch_id} ({} segments)", batch.len());
        pending.push(batch_future(
            batch,
            batch_id,
            translator.clone(),
            source_lang.to_string(),
            target_lang.to_string(),
            workers.clone(),
            provider_permits.clone(),
            inflight.clone(),
            settings.batch_timeout,
        ));
        *submitted += 1;
    };

    while channel_open || !pending.is_empty() {
        if cancel.is_cancelled() {
            return drain_for_cancel(pending, settings.grace).await;
        }
        tokio::select! {
            maybe_segment = rx.recv(), if channel_open => {
                match maybe_segment {
                    Some(segment) => {
                        if let Some(total) = audio_duration {
                            let progress =
                                segment.end.as_secs_f32() / total.as_secs_f32().max(0.001);
                            ledger
                                .update(task_id, StepLabel::Transcribe, StepUpdate::progress(progress.min(0.99)))
                                .await;
                        }
                        buffer.push(segment.clone());
                        segments.push(segment);

                        if buffer.len() >= settings.batch_size {
                            if let Some(translator) = &translator {
                                // Cancellation check before every batch submission.
                                if cancel.is_cancelled() {
                                    return drain_for_cancel(pending, settings.grace).await;
                                }
                                if submitted == 0 {
                                    ledger
                                        .update(task_id, StepLabel::Translate, StepUpdate::status(StepStatus::InProgress))
                                        .await;
                                }
                                submit(&mut buffer, &mut pending, &mut submitted, translator);
                            } else {
                                buffer.clear();
                            }
                        }
                    }
                    None => {
                        channel_open = false;
                        if !buffer.is_empty() {
                            if let Some(translator) = &translator {
                                if cancel.is_cancelled() {
                                    return drain_for_cancel(pending, settings.grace).await;
                                }
                                if submitted == 0 {
                                    ledger
                                        .update(task_id, StepLabel::Translate, StepUpdate::status(StepStatus::InProgress))
                                        .await;
                                }
                                submit(&mut buffer, &mut pending, &mut submitted, translator);
                            } else {
                                buffer.clear();
                            }
                        }
                    }
                }
            }
            Some((batch_id, result)) = pending.next(), if !pending.is_empty() => {
                match result {
                    Ok(done) => {
                        if done.texts.len() != done.expected {
                            return Err(VidsubError::InvalidInput(format!(
                                "backend returned {} translations for a {}-segment batch",
                                done.texts.len(),
                                done.expected
                            )));
                        }
                        completed += 1;
                        ledger
                            .log(
                                task_id,
                                format!(
                                    "batch {batch_id}: inflight={}, duration_ms={}, retry_count={}",
                                    done.inflight,
                                    done.duration.as_millis(),
                                    done.retry_count
                                ),
                            )
                            .await;
                        ledger.add_timing(task_id, "provider_calls", done.duration).await;
                        sink.insert(batch_id, done.texts);

                        let denominator = submitted.max(1) as f32;
                        ledger
                            .update(
                                task_id,
                                StepLabel::Translate,
                                StepUpdate::progress(completed as f32 / denominator * if channel_open { 0.9 } else { 1.0 }),
                            )
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = cancel.cancelled() => {
                return drain_for_cancel(pending, settings.grace).await;
            }
        }
    }

    let translations = if translator.is_some() {
        ledger
            .update(task_id, StepLabel::Translate, StepUpdate::status(StepStatus::Completed))
            .await;

        let mut texts: Vec<String> = Vec::with_capacity(segments.len());
        for (_batch_id, batch_texts) in sink {
            texts.extend(batch_texts);
        }
        if texts.len() != segments.len() {
            return Err(VidsubError::InvalidInput(format!(
                "translated {} of {} segments",
                texts.len(),
                segments.len()
            )));
        }
        Some(texts)
    } else {
        None
    };

    Ok(OverlapOutcome {
        segments,
        translations,
        batches: submitted,
    })
}

async fn drain_for_cancel(
    mut pending: FuturesUnordered<BatchFuture>,
    grace: Duration,
) -> Result<OverlapOutcome> {
    if !pending.is_empty() {
        let _ = tokio::time::timeout(grace, async {
            while pending.next().await.is_some() {}
        })
        .await;
    }
    Err(VidsubError::Cancelled)
}
