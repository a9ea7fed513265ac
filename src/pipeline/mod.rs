//! Pipeline coordinator.
//!
//! Drives a task through its stage graph to a terminal state: acquisition,
//! audio extraction, overlapped transcription/translation, subtitle
//! assembly and the optional render stages. Progress is reported to the
//! ledger as a weighted sum over the enabled steps; cancellation is checked
//! between stages and inside the overlap dispatcher.

pub mod dispatch;
pub mod progress;

pub use dispatch::{DispatchSettings, OverlapOutcome};
pub use progress::{
    ProgressLedger, ProgressSnapshot, Step, StepLabel, StepStatus, StepUpdate,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, VidsubError};
use crate::media::{FetchQuality, MediaFetcher, MediaMetadata, Toolkit};
use crate::subtitle;
use crate::task::{ArtifactKind, Choices, TaskKind, TaskResult};
use crate::transcribe::{SpeechBackend, TranscribeOptions};
use crate::translate::TranslateBackend;

/// Process-wide concurrency gates shared by all tasks.
pub struct Limits {
    /// Permits for outbound provider calls.
    pub provider: Arc<Semaphore>,
    /// Permits for concurrent speech-model runs.
    pub transcription: Arc<Semaphore>,
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: Arc::new(Semaphore::new(config.max_concurrent_provider_requests)),
            transcription: Arc::new(Semaphore::new(config.transcription_parallelism)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub translation_parallelism: usize,
    pub batch_timeout: Duration,
    pub cancel_grace: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            translation_parallelism: config.effective_translation_parallelism(),
            batch_timeout: Duration::from_secs(90),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// Source material and parameters for one task.
#[derive(Debug, Clone)]
pub enum TaskInput {
    Upload {
        file: PathBuf,
    },
    Fetch {
        url: String,
        quality: FetchQuality,
    },
    Cut {
        file: PathBuf,
        start: String,
        end: String,
    },
    Merge {
        files: Vec<PathBuf>,
    },
    Embed {
        video: PathBuf,
        subtitles: PathBuf,
    },
}

/// Everything a pipeline run needs to know about its task.
pub struct TaskContext {
    pub task_id: String,
    pub kind: TaskKind,
    pub input: TaskInput,
    pub choices: Choices,
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
}

pub struct Pipeline {
    fetcher: Arc<dyn MediaFetcher>,
    speech: Arc<dyn SpeechBackend>,
    toolkit: Arc<Toolkit>,
    ledger: Arc<ProgressLedger>,
    limits: Arc<Limits>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        speech: Arc<dyn SpeechBackend>,
        toolkit: Arc<Toolkit>,
        ledger: Arc<ProgressLedger>,
        limits: Arc<Limits>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            speech,
            toolkit,
            ledger,
            limits,
            settings,
        }
    }

    /// The steps a task of this shape will run, in order. Disabled steps
    /// are filtered out before weight normalization.
    pub fn enabled_steps(kind: TaskKind, choices: &Choices) -> Vec<StepLabel> {
        match kind {
            TaskKind::FetchOnly => vec![StepLabel::Fetch],
            TaskKind::Cut | TaskKind::Merge | TaskKind::Embed => vec![StepLabel::Transcode],
            TaskKind::Upload | TaskKind::FetchAndProcess => {
                let mut steps = Vec::new();
                if kind == TaskKind::FetchAndProcess {
                    steps.push(StepLabel::Fetch);
                }
                steps.push(StepLabel::ExtractAudio);
                steps.push(StepLabel::Transcribe);
                if choices.wants_translation() {
                    steps.push(StepLabel::Translate);
                }
                steps.push(StepLabel::Assemble);
                if choices.create_burned_video {
                    steps.push(StepLabel::Burn);
                }
                if choices.watermark.is_some() {
                    steps.push(StepLabel::Watermark);
                }
                steps
            }
        }
    }

    /// Drive the task to completion. The translator is resolved once at
    /// task creation and handed in here.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        translator: Option<Arc<dyn TranslateBackend>>,
    ) -> Result<TaskResult> {
        let steps = Self::enabled_steps(ctx.kind, &ctx.choices);
        self.ledger.begin(&ctx.task_id, &steps).await;
        tokio::fs::create_dir_all(&ctx.workdir).await?;

        let mut result = TaskResult::empty();

        match ctx.input.clone() {
            TaskInput::Fetch { url, quality } => {
                let (path, metadata) = self.run_fetch(ctx, &url, quality, &mut result).await?;
                if ctx.kind == TaskKind::FetchOnly {
                    result.artifacts.insert(ArtifactKind::Source, path);
                    result.media_metadata = Some(metadata);
                    return Ok(result);
                }
                self.process_media(ctx, path, Some(metadata), translator, &mut result)
                    .await?;
            }
            TaskInput::Upload { file } => {
                let metadata = self.toolkit.probe_metadata(&file).await?;
                // Uploads move into the task directory so every artifact,
                // including the source, lives under one sweepable root.
                let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("bin");
                let source = ctx.workdir.join(format!("source.{ext}"));
                tokio::fs::copy(&file, &source).await?;
                self.process_media(ctx, source, Some(metadata), translator, &mut result)
                    .await?;
            }
            TaskInput::Cut { file, start, end } => {
                let output = ctx.workdir.join("final.mp4");
                self.run_transcode(ctx, &mut result, |cancel| {
                    let toolkit = self.toolkit.clone();
                    let file = file.clone();
                    let output = output.clone();
                    let (start, end) = (start.clone(), end.clone());
                    async move { toolkit.cut(&file, &output, &start, &end, &cancel).await }
                })
                .await?;
                result.artifacts.insert(ArtifactKind::FinalVideo, output);
            }
            TaskInput::Merge { files } => {
                let output = ctx.workdir.join("final.mp4");
                self.run_transcode(ctx, &mut result, |cancel| {
                    let toolkit = self.toolkit.clone();
                    let files = files.clone();
                    let output = output.clone();
                    async move { toolkit.merge(&files, &output, &cancel).await }
                })
                .await?;
                result.artifacts.insert(ArtifactKind::FinalVideo, output);
            }
            TaskInput::Embed { video, subtitles } => {
                // Re-emit the provided subtitles in canonical form first.
                let content = tokio::fs::read_to_string(&subtitles).await?;
                let cues = subtitle::normalize(subtitle::parse(&content)?);
                if cues.is_empty() {
                    return Err(VidsubError::InvalidInput(
                        "subtitle file contains no usable cues".to_string(),
                    ));
                }
                let canonical = ctx.workdir.join("subtitles.srt");
                tokio::fs::write(&canonical, subtitle::emit(&cues)).await?;

                let output = ctx.workdir.join("final.mp4");
                self.run_transcode(ctx, &mut result, |cancel| {
                    let toolkit = self.toolkit.clone();
                    let video = video.clone();
                    let srt = canonical.clone();
                    let output = output.clone();
                    async move { toolkit.burn_subtitles(&video, &srt, &output, &cancel).await }
                })
                .await?;
                result
                    .artifacts
                    .insert(ArtifactKind::OriginalSubtitles, canonical);
                result.artifacts.insert(ArtifactKind::FinalVideo, output);
            }
        }

        Ok(result)
    }

    /// FETCH stage: probe then download, with one retry on timeout.
    async fn run_fetch(
        &self,
        ctx: &TaskContext,
        url: &str,
        quality: FetchQuality,
        result: &mut TaskResult,
    ) -> Result<(PathBuf, MediaMetadata)> {
        self.check_cancel(ctx)?;
        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Fetch,
                StepUpdate::status(StepStatus::InProgress).with_subtitle(url.to_string()),
            )
            .await;
        let started = Instant::now();

        let mut attempt_result = self.fetch_once(ctx, url, quality).await;
        if let Err(VidsubError::StageTimeout { .. }) = attempt_result {
            warn!("{}: fetch timed out, retrying once", ctx.task_id);
            attempt_result = self.fetch_once(ctx, url, quality).await;
        }
        let (path, metadata) = attempt_result?;

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Fetch,
                StepUpdate::status(StepStatus::Completed),
            )
            .await;
        result
            .timing
            .insert("fetch".to_string(), started.elapsed().as_secs_f64());
        info!(
            "{}: fetched {} ({:.1}s of media)",
            ctx.task_id,
            metadata.title,
            metadata.duration().as_secs_f64()
        );
        Ok((path, metadata))
    }

    async fn fetch_once(
        &self,
        ctx: &TaskContext,
        url: &str,
        quality: FetchQuality,
    ) -> Result<(PathBuf, MediaMetadata)> {
        let (progress_tx, forwarder) =
            self.progress_forwarder(&ctx.task_id, StepLabel::Fetch);
        let callback = move |p: f64| {
            let _ = progress_tx.send(p);
        };
        let outcome = self
            .fetcher
            .fetch(url, quality, &ctx.workdir, &ctx.cancel, &callback)
            .await;
        drop(callback);
        let _ = forwarder.await;
        outcome
    }

    /// Single-step transcode kinds (cut, merge, embed).
    async fn run_transcode<F, Fut>(
        &self,
        ctx: &TaskContext,
        result: &mut TaskResult,
        op: F,
    ) -> Result<()>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.check_cancel(ctx)?;
        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Transcode,
                StepUpdate {
                    status: Some(StepStatus::InProgress),
                    indeterminate: Some(true),
                    ..Default::default()
                },
            )
            .await;
        let started = Instant::now();

        retry_transcode_once(&ctx.task_id, || op(ctx.cancel.clone())).await?;

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Transcode,
                StepUpdate::status(StepStatus::Completed),
            )
            .await;
        result
            .timing
            .insert("transcode".to_string(), started.elapsed().as_secs_f64());
        Ok(())
    }

    /// The processing core: extract audio, transcribe with translation
    /// overlap, assemble subtitle artifacts, optionally render.
    async fn process_media(
        &self,
        ctx: &TaskContext,
        source: PathBuf,
        metadata: Option<MediaMetadata>,
        translator: Option<Arc<dyn TranslateBackend>>,
        result: &mut TaskResult,
    ) -> Result<()> {
        result
            .artifacts
            .insert(ArtifactKind::Source, source.clone());
        result.media_metadata = metadata.clone();

        // ── extract audio ──
        self.check_cancel(ctx)?;
        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::ExtractAudio,
                StepUpdate::status(StepStatus::InProgress),
            )
            .await;
        let started = Instant::now();

        let audio = ctx.workdir.join("audio.wav");
        retry_transcode_once(&ctx.task_id, || {
            let toolkit = self.toolkit.clone();
            let source = source.clone();
            let audio = audio.clone();
            let cancel = ctx.cancel.clone();
            let (progress_tx, forwarder) =
                self.progress_forwarder(&ctx.task_id, StepLabel::ExtractAudio);
            async move {
                let callback = move |p: f64| {
                    let _ = progress_tx.send(p);
                };
                let outcome = toolkit.extract_audio(&source, &audio, &cancel, callback).await;
                let _ = forwarder.await;
                outcome
            }
        })
        .await?;

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::ExtractAudio,
                StepUpdate::status(StepStatus::Completed),
            )
            .await;
        result
            .timing
            .insert("extract_audio".to_string(), started.elapsed().as_secs_f64());
        result.artifacts.insert(ArtifactKind::Audio, audio.clone());

        // ── transcribe + translate (overlapped) ──
        self.check_cancel(ctx)?;
        let audio_duration = match &metadata {
            Some(m) if m.duration_ms > 0 => m.duration(),
            _ => self.toolkit.probe_duration(&audio).await?,
        };

        if ctx.choices.wants_translation() && translator.is_none() {
            return Err(VidsubError::Config(
                "task wants translation but no translator was configured".to_string(),
            ));
        }
        let dispatch_translator = if ctx.choices.wants_translation() {
            translator
        } else {
            None
        };

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Transcribe,
                StepUpdate::status(StepStatus::InProgress),
            )
            .await;
        let started = Instant::now();

        let mut attempt = self
            .run_overlap_stage(ctx, &audio, audio_duration, dispatch_translator.clone())
            .await;
        if let Err(VidsubError::BackendTimeout(_)) = attempt {
            // Transcription is idempotent; one more try before giving up.
            warn!("{}: transcription timed out, retrying once", ctx.task_id);
            attempt = self
                .run_overlap_stage(ctx, &audio, audio_duration, dispatch_translator)
                .await;
        }
        let (overlap, detected_language) = match attempt {
            Ok(v) => v,
            Err(VidsubError::BackendTimeout(_)) => {
                return Err(VidsubError::StageTimeout {
                    stage: "transcribe".to_string(),
                    seconds: transcription_ceiling(audio_duration).as_secs(),
                })
            }
            Err(e) => return Err(e),
        };

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Transcribe,
                StepUpdate::status(StepStatus::Completed),
            )
            .await;
        let overlap_secs = started.elapsed().as_secs_f64();
        result.timing.insert("transcribe".to_string(), overlap_secs);
        if overlap.translations.is_some() {
            result.timing.insert("translate".to_string(), overlap_secs);
        }
        info!(
            "{}: transcribed {} segments in {} batches (language: {detected_language})",
            ctx.task_id,
            overlap.segments.len(),
            overlap.batches
        );

        // ── assemble subtitle artifacts ──
        self.check_cancel(ctx)?;
        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Assemble,
                StepUpdate::status(StepStatus::InProgress),
            )
            .await;
        let started = Instant::now();

        let originals = subtitle::clamp_overlaps(overlap.segments);
        subtitle::validate(&originals)?;

        let original_path = ctx.workdir.join("original.srt");
        tokio::fs::write(&original_path, subtitle::emit(&originals)).await?;
        result
            .artifacts
            .insert(ArtifactKind::OriginalSubtitles, original_path.clone());

        let translated_path = if ctx.choices.transcription_only {
            None
        } else {
            let texts: Vec<String> = match overlap.translations {
                Some(texts) => texts
                    .into_iter()
                    .zip(originals.iter())
                    .map(|(text, seg)| {
                        if text.trim().is_empty() {
                            seg.text.clone()
                        } else {
                            text
                        }
                    })
                    .collect(),
                // Identity pair: the translated track is the original text.
                None => originals.iter().map(|s| s.text.clone()).collect(),
            };
            let translated = subtitle::with_texts(&originals, &texts)?;
            let path = ctx.workdir.join("translated.srt");
            tokio::fs::write(&path, subtitle::emit(&translated)).await?;
            result
                .artifacts
                .insert(ArtifactKind::TranslatedSubtitles, path.clone());
            Some(path)
        };

        self.ledger
            .update(
                &ctx.task_id,
                StepLabel::Assemble,
                StepUpdate::status(StepStatus::Completed),
            )
            .await;
        result
            .timing
            .insert("assemble".to_string(), started.elapsed().as_secs_f64());

        // ── optional render stages ──
        let mut rendered: Option<PathBuf> = None;
        if ctx.choices.create_burned_video {
            self.check_cancel(ctx)?;
            self.ledger
                .update(
                    &ctx.task_id,
                    StepLabel::Burn,
                    StepUpdate {
                        status: Some(StepStatus::InProgress),
                        indeterminate: Some(true),
                        ..Default::default()
                    },
                )
                .await;
            let started = Instant::now();

            let srt = translated_path
                .clone()
                .unwrap_or_else(|| original_path.clone());
            let output = if ctx.choices.watermark.is_some() {
                ctx.workdir.join("burned.mp4")
            } else {
                ctx.workdir.join("final.mp4")
            };
            retry_transcode_once(&ctx.task_id, || {
                let toolkit = self.toolkit.clone();
                let source = source.clone();
                let srt = srt.clone();
                let output = output.clone();
                let cancel = ctx.cancel.clone();
                async move { toolkit.burn_subtitles(&source, &srt, &output, &cancel).await }
            })
            .await?;

            self.ledger
                .update(
                    &ctx.task_id,
                    StepLabel::Burn,
                    StepUpdate::status(StepStatus::Completed),
                )
                .await;
            result
                .timing
                .insert("burn".to_string(), started.elapsed().as_secs_f64());
            result
                .artifacts
                .insert(ArtifactKind::FinalVideo, output.clone());
            rendered = Some(output);
        }

        if let Some(spec) = &ctx.choices.watermark {
            self.check_cancel(ctx)?;
            self.ledger
                .update(
                    &ctx.task_id,
                    StepLabel::Watermark,
                    StepUpdate {
                        status: Some(StepStatus::InProgress),
                        indeterminate: Some(true),
                        ..Default::default()
                    },
                )
                .await;
            let started = Instant::now();

            let input = rendered.clone().unwrap_or_else(|| source.clone());
            let output = ctx.workdir.join("final.mp4");
            retry_transcode_once(&ctx.task_id, || {
                let toolkit = self.toolkit.clone();
                let input = input.clone();
                let spec = spec.clone();
                let output = output.clone();
                let cancel = ctx.cancel.clone();
                async move { toolkit.overlay_watermark(&input, &spec, &output, &cancel).await }
            })
            .await?;

            self.ledger
                .update(
                    &ctx.task_id,
                    StepLabel::Watermark,
                    StepUpdate::status(StepStatus::Completed),
                )
                .await;
            result
                .timing
                .insert("watermark".to_string(), started.elapsed().as_secs_f64());
            result.artifacts.insert(ArtifactKind::FinalVideo, output);
        }

        result.detected_language = Some(detected_language);
        Ok(())
    }

    /// One attempt at the overlapped transcribe/translate stage.
    async fn run_overlap_stage(
        &self,
        ctx: &TaskContext,
        audio: &Path,
        audio_duration: Duration,
        translator: Option<Arc<dyn TranslateBackend>>,
    ) -> Result<(OverlapOutcome, String)> {
        let (tx, rx) = mpsc::channel(self.settings.batch_size);
        let stage_cancel = ctx.cancel.child_token();

        let opts = TranscribeOptions {
            model: ctx.choices.transcription_model,
            source_lang: (ctx.choices.source_lang != "auto")
                .then(|| ctx.choices.source_lang.clone()),
            time_limit: Some(transcription_ceiling(audio_duration)),
        };

        // Speech-model gate; waits here when another task holds the model.
        let permit = tokio::select! {
            permit = self.limits.transcription.clone().acquire_owned() => {
                permit.expect("semaphore closed")
            }
            _ = ctx.cancel.cancelled() => return Err(VidsubError::Cancelled),
        };

        let speech = self.speech.clone();
        let audio_path = audio.to_path_buf();
        let speech_cancel = stage_cancel.clone();
        let speech_task = tokio::spawn(async move {
            let _permit = permit;
            speech
                .transcribe(&audio_path, &opts, tx, &speech_cancel)
                .await
        });

        let dispatch_settings = DispatchSettings {
            batch_size: self.settings.batch_size,
            parallelism: self.settings.translation_parallelism,
            batch_timeout: self.settings.batch_timeout,
            grace: self.settings.cancel_grace,
        };

        let overlap = dispatch::run_overlap(
            rx,
            translator,
            &ctx.choices.source_lang,
            &ctx.choices.target_lang,
            &dispatch_settings,
            self.limits.provider.clone(),
            &ctx.cancel,
            &self.ledger,
            &ctx.task_id,
            Some(audio_duration),
        )
        .await;

        let overlap = match overlap {
            Ok(outcome) => outcome,
            Err(e) => {
                stage_cancel.cancel();
                let _ = speech_task.await;
                return Err(e);
            }
        };

        let detected = speech_task.await.map_err(|e| {
            VidsubError::BackendUnavailable(format!("transcription task failed: {e}"))
        })??;

        Ok((overlap, detected))
    }

    fn check_cancel(&self, ctx: &TaskContext) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            Err(VidsubError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Bridge a synchronous progress callback into ledger updates.
    fn progress_forwarder(
        &self,
        task_id: &str,
        label: StepLabel,
    ) -> (watch::Sender<f64>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = watch::channel(0.0f64);
        let ledger = self.ledger.clone();
        let task_id = task_id.to_string();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow();
                ledger
                    .update(&task_id, label, StepUpdate::progress(value as f32))
                    .await;
            }
        });
        (tx, handle)
    }
}

/// Transcription ceiling: twice the audio duration, with an hour floor.
fn transcription_ceiling(audio_duration: Duration) -> Duration {
    (audio_duration * 2).max(Duration::from_secs(3600))
}

/// Toolkit operations are pure over their inputs, so a run that hits the
/// transcode ceiling gets one more attempt before the failure escalates
/// to a stage timeout.
async fn retry_transcode_once<F, Fut>(task_id: &str, op: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempt = op().await;
    if let Err(VidsubError::TranscodeTimeout { .. }) = attempt {
        warn!("{task_id}: transcode timed out, retrying once");
        attempt = op().await;
    }
    match attempt {
        Err(VidsubError::TranscodeTimeout { seconds }) => Err(VidsubError::StageTimeout {
            stage: "transcode".to_string(),
            seconds,
        }),
        other => other,
    }
}
