use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use vidsub::media::{FetchQuality, Toolkit, YtDlpFetcher};
use vidsub::pipeline::{Limits, Pipeline, PipelineSettings, ProgressLedger, TaskContext, TaskInput};
use vidsub::summary::SummaryHook;
use vidsub::task::{ArtifactKind, Choices, TaskKind, TaskRegistry, TaskState};
use vidsub::transcribe::{WhisperCppBackend, WhisperModel};
use vidsub::translate::{create_translator, TranslatorKind};
use vidsub::Config;

#[derive(Parser)]
#[command(name = "vidsub")]
#[command(version, about = "Video transcription, translation and subtitling")]
#[command(
    long_about = "Transcribe, translate and optionally re-render videos with burned-in subtitles."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe and translate a local file or a URL
    Process {
        /// Input video/audio file or http(s) URL
        input: String,

        /// Source language code or 'auto'
        #[arg(short, long, default_value = "auto")]
        source_lang: String,

        /// Target language code
        #[arg(short, long, default_value = "en")]
        target_lang: String,

        /// Speech model: tiny, base, small, medium, large
        #[arg(short, long, default_value = "base")]
        model: String,

        /// Translation backend: simple, llm
        #[arg(short, long, default_value = "llm")]
        backend: String,

        /// Render a video with burned-in subtitles
        #[arg(long)]
        burn: bool,

        /// Skip translation, produce the original-language track only
        #[arg(long)]
        transcription_only: bool,

        /// Download quality for URLs: best, 1080p, 720p, audio
        #[arg(long, default_value = "best")]
        quality: String,

        /// Generate a markdown summary after success, with an optional
        /// extra instruction
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        summary: Option<String>,
    },
    /// Download a URL without processing it
    Fetch {
        url: String,

        /// Quality: best, 1080p, 720p, audio
        #[arg(long, default_value = "best")]
        quality: String,
    },
    /// Cut a clip out of a file
    Cut {
        file: PathBuf,

        /// Start time (HH:MM:SS, MM:SS or SS)
        #[arg(long)]
        start: String,

        /// End time (HH:MM:SS, MM:SS or SS)
        #[arg(long)]
        end: String,
    },
    /// Concatenate files
    Merge {
        #[arg(required = true, num_args = 2..)]
        files: Vec<PathBuf>,
    },
    /// Burn an existing subtitle file into a video
    Embed { video: PathBuf, subtitles: PathBuf },
    /// Check that external binaries are installed
    Doctor,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

struct Runtime {
    config: Config,
    ledger: Arc<ProgressLedger>,
    registry: Arc<TaskRegistry>,
    pipeline: Arc<Pipeline>,
}

impl Runtime {
    fn new(config: Config) -> Self {
        let ledger = Arc::new(ProgressLedger::new());
        let limits = Arc::new(Limits::from_config(&config));
        let toolkit = Arc::new(Toolkit::new(&config));
        let fetcher = Arc::new(YtDlpFetcher::new(&config));
        let speech = Arc::new(WhisperCppBackend::new(&config));
        let pipeline = Arc::new(Pipeline::new(
            fetcher,
            speech,
            toolkit,
            ledger.clone(),
            limits,
            PipelineSettings::from_config(&config),
        ));
        let registry = Arc::new(TaskRegistry::new(&config, ledger.clone()));
        let _sweeper = registry.spawn_sweeper(Duration::from_secs(60));

        Self {
            config,
            ledger,
            registry,
            pipeline,
        }
    }

    /// Create, submit and watch one task through to its terminal state.
    async fn run_task(
        &self,
        kind: TaskKind,
        input: TaskInput,
        choices: Choices,
        quiet: bool,
    ) -> Result<String> {
        let task_id = self
            .registry
            .create(kind, choices.clone())
            .await
            .context("failed to create task")?;

        let processes_media = matches!(kind, TaskKind::Upload | TaskKind::FetchAndProcess);
        let translator = if processes_media && choices.wants_translation() {
            Some(
                create_translator(choices.translator_backend, &self.config)
                    .context("failed to configure translator")?,
            )
        } else {
            None
        };

        let handle = self
            .registry
            .get(&task_id)
            .await
            .expect("task just created");
        let ctx = TaskContext {
            task_id: task_id.clone(),
            kind,
            input,
            choices,
            workdir: self.registry.workdir(&task_id),
            cancel: handle.cancel.clone(),
        };

        // First Ctrl+C cancels cooperatively; the second force-exits.
        let cancel = handle.cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                std::process::exit(1);
            }
            eprintln!("\nReceived Ctrl+C, cancelling... (press again to force quit)");
            cancel.cancel();
        })
        .ok();

        let pipeline = self.pipeline.clone();
        let join = self
            .registry
            .submit(&task_id, async move { pipeline.run(&ctx, translator).await })
            .await
            .context("failed to submit task")?;

        let watcher = if quiet {
            None
        } else {
            Some(self.spawn_progress_bar(task_id.clone()))
        };

        join.await.context("task worker panicked")?;
        if let Some(watcher) = watcher {
            watcher.await.ok();
        }
        Ok(task_id)
    }

    fn spawn_progress_bar(&self, task_id: String) -> tokio::task::JoinHandle<()> {
        let ledger = self.ledger.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );

            loop {
                let status = registry.get_status(&task_id).await;
                if let Some(snapshot) = ledger.snapshot(&task_id).await {
                    bar.set_position(snapshot.overall_percent as u64);
                    let active = snapshot
                        .steps
                        .iter()
                        .find(|s| s.status == vidsub::pipeline::StepStatus::InProgress)
                        .map(|s| s.label.to_string())
                        .unwrap_or_default();
                    bar.set_message(active);
                }
                if status.state.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            bar.finish_and_clear();
        })
    }

    async fn report(&self, task_id: &str) -> Result<()> {
        let status = self.registry.get_status(task_id).await;
        match status.state {
            TaskState::Succeeded => {
                let result = status.result.expect("succeeded task has a result");
                println!();
                println!("Task {task_id} succeeded");
                if let Some(lang) = &result.detected_language {
                    println!("  Detected language: {lang}");
                }
                let mut artifacts: Vec<_> = result.artifacts.iter().collect();
                artifacts.sort_by_key(|(k, _)| k.as_str());
                for (kind, path) in artifacts {
                    println!("  {:<22} {}", kind.as_str(), path.display());
                }
                let mut timing: Vec<_> = result.timing.iter().collect();
                timing.sort_by(|a, b| a.0.cmp(b.0));
                for (step, seconds) in timing {
                    println!("  {step:<22} {seconds:.2}s");
                }
                Ok(())
            }
            TaskState::Cancelled => {
                println!("Task {task_id} was cancelled");
                Ok(())
            }
            _ => {
                let message = status
                    .error
                    .map(|e| e.user_facing_message)
                    .unwrap_or_else(|| "task failed".to_string());
                error!("{message}");
                anyhow::bail!("{message}")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    if let Command::Doctor = cli.command {
        return doctor(&config).await;
    }

    let runtime = Runtime::new(config);

    match cli.command {
        Command::Process {
            input,
            source_lang,
            target_lang,
            model,
            backend,
            burn,
            transcription_only,
            quality,
            summary,
        } => {
            let transcription_model: WhisperModel =
                model.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let translator_backend: TranslatorKind =
                backend.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let quality: FetchQuality =
                quality.parse().map_err(|e: String| anyhow::anyhow!(e))?;

            let choices = Choices {
                source_lang,
                target_lang,
                create_burned_video: burn,
                transcription_model,
                translator_backend,
                watermark: None,
                transcription_only,
            };

            let (kind, task_input) = if input.starts_with("http://") || input.starts_with("https://")
            {
                (TaskKind::FetchAndProcess, TaskInput::Fetch { url: input, quality })
            } else {
                let file = PathBuf::from(&input);
                if !file.exists() {
                    anyhow::bail!("Input file not found: {input}");
                }
                (TaskKind::Upload, TaskInput::Upload { file })
            };

            let task_id = runtime
                .run_task(kind, task_input, choices, cli.quiet)
                .await?;
            runtime.report(&task_id).await?;

            if let Some(prompt) = summary {
                run_summary(&runtime, &task_id, &prompt).await?;
            }
        }
        Command::Fetch { url, quality } => {
            let quality: FetchQuality =
                quality.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let task_id = runtime
                .run_task(
                    TaskKind::FetchOnly,
                    TaskInput::Fetch { url, quality },
                    Choices::default(),
                    cli.quiet,
                )
                .await?;
            runtime.report(&task_id).await?;
        }
        Command::Cut { file, start, end } => {
            if !file.exists() {
                anyhow::bail!("Input file not found: {}", file.display());
            }
            let task_id = runtime
                .run_task(
                    TaskKind::Cut,
                    TaskInput::Cut { file, start, end },
                    Choices::default(),
                    cli.quiet,
                )
                .await?;
            runtime.report(&task_id).await?;
        }
        Command::Merge { files } => {
            for file in &files {
                if !file.exists() {
                    anyhow::bail!("Input file not found: {}", file.display());
                }
            }
            let task_id = runtime
                .run_task(
                    TaskKind::Merge,
                    TaskInput::Merge { files },
                    Choices::default(),
                    cli.quiet,
                )
                .await?;
            runtime.report(&task_id).await?;
        }
        Command::Embed { video, subtitles } => {
            for file in [&video, &subtitles] {
                if !file.exists() {
                    anyhow::bail!("Input file not found: {}", file.display());
                }
            }
            let task_id = runtime
                .run_task(
                    TaskKind::Embed,
                    TaskInput::Embed { video, subtitles },
                    Choices::default(),
                    cli.quiet,
                )
                .await?;
            runtime.report(&task_id).await?;
        }
        Command::Doctor => unreachable!("handled above"),
    }

    Ok(())
}

async fn run_summary(runtime: &Runtime, task_id: &str, prompt: &str) -> Result<()> {
    let status = runtime.registry.get_status(task_id).await;
    let Some(result) = status.result else {
        anyhow::bail!("summary requested but the task did not succeed");
    };
    let subtitle_path = result
        .artifacts
        .get(&ArtifactKind::TranslatedSubtitles)
        .or_else(|| result.artifacts.get(&ArtifactKind::OriginalSubtitles))
        .context("no subtitle artifact to summarize")?;

    let api_key = runtime
        .config
        .llm_api_key
        .clone()
        .context("LLM API key not set. Set VIDSUB_LLM_API_KEY.")?;
    let hook = SummaryHook::new(api_key, runtime.config.summary_prompt_max_chars);

    let choices = status.choices.unwrap_or_default();
    let custom = (!prompt.is_empty()).then_some(prompt);
    let markdown = hook
        .summarize(subtitle_path, &choices.target_lang, custom)
        .await
        .context("summary generation failed")?;

    let out = runtime.registry.workdir(task_id).join("summary.md");
    tokio::fs::write(&out, &markdown).await?;
    println!("  {:<22} {}", "summary", out.display());
    Ok(())
}

async fn doctor(config: &Config) -> Result<()> {
    let toolkit = Toolkit::new(config);
    let fetcher = YtDlpFetcher::new(config);
    let speech = WhisperCppBackend::new(config);

    let mut failures = 0;
    match toolkit.check_binaries().await {
        Ok(()) => println!("  ffmpeg/ffprobe     ok"),
        Err(e) => {
            failures += 1;
            println!("  ffmpeg/ffprobe     MISSING ({e})");
        }
    }
    match fetcher.check_binary().await {
        Ok(()) => println!("  yt-dlp             ok"),
        Err(e) => {
            failures += 1;
            println!("  yt-dlp             MISSING ({e})");
        }
    }
    match speech.check_binary().await {
        Ok(()) => println!("  whisper-cli        ok"),
        Err(e) => {
            failures += 1;
            println!("  whisper-cli        MISSING ({e})");
        }
    }
    println!(
        "  model dir          {}",
        config.whisper_model_dir.display()
    );

    if failures > 0 {
        anyhow::bail!("{failures} dependency check(s) failed");
    }
    println!("All dependencies available.");
    Ok(())
}
