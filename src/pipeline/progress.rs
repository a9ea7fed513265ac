//! Per-task progress ledger.
//!
//! Observers poll `snapshot` while stages run. Writes for a task are
//! serialized through its own mutex; step progress is clamped so observers
//! only ever see it advance, and status transitions cannot move backwards.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Default bound on retained log lines per task.
const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepLabel {
    Fetch,
    ExtractAudio,
    Transcribe,
    Translate,
    Assemble,
    Burn,
    Watermark,
    Transcode,
}

impl StepLabel {
    /// Relative cost before normalization.
    pub fn default_weight(&self) -> f32 {
        match self {
            StepLabel::Fetch => 0.15,
            StepLabel::ExtractAudio => 0.10,
            StepLabel::Transcribe => 0.40,
            StepLabel::Translate => 0.15,
            StepLabel::Assemble => 0.10,
            StepLabel::Burn => 0.05,
            StepLabel::Watermark => 0.05,
            StepLabel::Transcode => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepLabel::Fetch => "fetch",
            StepLabel::ExtractAudio => "extract_audio",
            StepLabel::Transcribe => "transcribe",
            StepLabel::Translate => "translate",
            StepLabel::Assemble => "assemble",
            StepLabel::Burn => "burn",
            StepLabel::Watermark => "watermark",
            StepLabel::Transcode => "transcode",
        }
    }
}

impl std::fmt::Display for StepLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    InProgress,
    Completed,
    Error,
}

impl StepStatus {
    fn rank(&self) -> u8 {
        match self {
            StepStatus::Waiting => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Error => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub label: StepLabel,
    pub weight: f32,
    pub status: StepStatus,
    pub progress: f32,
    pub subtitle: String,
    pub indeterminate: bool,
    #[serde(skip)]
    started_at: Option<Instant>,
}

impl Step {
    /// Effective progress, deriving pseudo-progress for indeterminate
    /// steps from elapsed time (asymptotic, capped at 0.95 until the step
    /// reports completion).
    fn effective_progress(&self) -> f32 {
        match self.status {
            StepStatus::Completed => 1.0,
            StepStatus::InProgress if self.indeterminate => {
                let elapsed = self
                    .started_at
                    .map(|t| t.elapsed().as_secs_f32())
                    .unwrap_or(0.0);
                (elapsed / (elapsed + 30.0)).min(0.95)
            }
            _ => self.progress,
        }
    }
}

/// Partial update to a step. Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct StepUpdate {
    pub progress: Option<f32>,
    pub status: Option<StepStatus>,
    pub subtitle: Option<String>,
    pub indeterminate: Option<bool>,
}

impl StepUpdate {
    pub fn progress(value: f32) -> Self {
        Self {
            progress: Some(value),
            ..Default::default()
        }
    }

    pub fn status(value: StepStatus) -> Self {
        Self {
            status: Some(value),
            ..Default::default()
        }
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }
}

/// Consistent copy of a task's observable progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub steps: Vec<Step>,
    pub overall_percent: f32,
    pub logs_tail: Vec<String>,
    /// Cumulative provider call time, keyed by counter name, in ms.
    pub timing_ms: HashMap<String, u64>,
}

#[derive(Debug)]
struct TaskProgress {
    steps: Vec<Step>,
    logs: VecDeque<String>,
    timing: HashMap<String, Duration>,
}

/// Append-only, per-task record of step states and logs.
pub struct ProgressLedger {
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskProgress>>>>,
    log_capacity: usize,
}

impl Default for ProgressLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            log_capacity,
        }
    }

    /// Register a task with its enabled steps. Weights are normalized so
    /// they sum to 1.
    pub async fn begin(&self, task_id: &str, labels: &[StepLabel]) {
        let total: f32 = labels.iter().map(|l| l.default_weight()).sum();
        let steps = labels
            .iter()
            .map(|label| Step {
                label: *label,
                weight: if total > 0.0 {
                    label.default_weight() / total
                } else {
                    0.0
                },
                status: StepStatus::Waiting,
                progress: 0.0,
                subtitle: String::new(),
                indeterminate: false,
                started_at: None,
            })
            .collect();

        let entry = Arc::new(Mutex::new(TaskProgress {
            steps,
            logs: VecDeque::new(),
            timing: HashMap::new(),
        }));
        self.tasks.write().await.insert(task_id.to_string(), entry);
    }

    async fn entry(&self, task_id: &str) -> Option<Arc<Mutex<TaskProgress>>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn update(&self, task_id: &str, label: StepLabel, update: StepUpdate) {
        let Some(entry) = self.entry(task_id).await else {
            return;
        };
        let mut task = entry.lock().await;
        let Some(step) = task.steps.iter_mut().find(|s| s.label == label) else {
            return;
        };

        if let Some(indeterminate) = update.indeterminate {
            step.indeterminate = indeterminate;
        }
        if let Some(subtitle) = update.subtitle {
            step.subtitle = subtitle;
        }
        if let Some(progress) = update.progress {
            // Progress may only advance.
            step.progress = step.progress.max(progress.clamp(0.0, 1.0));
        }
        if let Some(status) = update.status {
            // No back-edges: waiting -> in_progress -> {completed|error}.
            if status.rank() > step.status.rank() {
                debug!("{task_id}: step {} -> {:?}", step.label, status);
                step.status = status;
                match status {
                    StepStatus::InProgress => step.started_at = Some(Instant::now()),
                    StepStatus::Completed => step.progress = 1.0,
                    _ => {}
                }
            }
        }
    }

    pub async fn log(&self, task_id: &str, line: impl Into<String>) {
        let Some(entry) = self.entry(task_id).await else {
            return;
        };
        let mut task = entry.lock().await;
        if task.logs.len() >= self.log_capacity {
            task.logs.pop_front();
        }
        task.logs.push_back(line.into());
    }

    /// Add to a cumulative timing counter (e.g. provider call time).
    pub async fn add_timing(&self, task_id: &str, key: &str, elapsed: Duration) {
        let Some(entry) = self.entry(task_id).await else {
            return;
        };
        let mut task = entry.lock().await;
        *task.timing.entry(key.to_string()).or_default() += elapsed;
    }

    /// Flip any in-progress step to error. Called once when a task fails
    /// so observers see where it stopped.
    pub async fn fail_active_steps(&self, task_id: &str) {
        let Some(entry) = self.entry(task_id).await else {
            return;
        };
        let mut task = entry.lock().await;
        for step in &mut task.steps {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Error;
            }
        }
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let entry = self.entry(task_id).await?;
        let task = entry.lock().await;

        let mut steps = task.steps.clone();
        for step in &mut steps {
            step.progress = step.effective_progress();
        }
        let overall_percent: f32 = steps
            .iter()
            .map(|s| s.weight * s.progress)
            .sum::<f32>()
            * 100.0;

        Some(ProgressSnapshot {
            steps,
            overall_percent,
            logs_tail: task.logs.iter().cloned().collect(),
            timing_ms: task
                .timing
                .iter()
                .map(|(k, v)| (k.clone(), v.as_millis() as u64))
                .collect(),
        })
    }

    pub async fn remove(&self, task_id: &str) {
        self.tasks.write().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_weights_normalized() {
        let ledger = ProgressLedger::new();
        ledger
            .begin(
                "t1",
                &[
                    StepLabel::Fetch,
                    StepLabel::ExtractAudio,
                    StepLabel::Transcribe,
                ],
            )
            .await;
        let snap = ledger.snapshot("t1").await.unwrap();
        let total: f32 = snap.steps.iter().map(|s| s.weight).sum();
        assert!((total - 1.0).abs() < 1e-5);
        // Transcribe keeps the biggest share.
        assert!(snap.steps[2].weight > snap.steps[0].weight);
    }

    #[tokio::test]
    async fn test_progress_only_advances() {
        let ledger = ProgressLedger::new();
        ledger.begin("t1", &[StepLabel::Transcribe]).await;

        ledger
            .update("t1", StepLabel::Transcribe, StepUpdate::progress(0.5))
            .await;
        ledger
            .update("t1", StepLabel::Transcribe, StepUpdate::progress(0.3))
            .await;

        let snap = ledger.snapshot("t1").await.unwrap();
        assert_eq!(snap.steps[0].progress, 0.5);
    }

    #[tokio::test]
    async fn test_no_status_back_edges() {
        let ledger = ProgressLedger::new();
        ledger.begin("t1", &[StepLabel::Fetch]).await;

        ledger
            .update("t1", StepLabel::Fetch, StepUpdate::status(StepStatus::Completed))
            .await;
        ledger
            .update(
                "t1",
                StepLabel::Fetch,
                StepUpdate::status(StepStatus::InProgress),
            )
            .await;

        let snap = ledger.snapshot("t1").await.unwrap();
        assert_eq!(snap.steps[0].status, StepStatus::Completed);
        assert_eq!(snap.steps[0].progress, 1.0);
    }

    #[tokio::test]
    async fn test_overall_percent_weighted() {
        let ledger = ProgressLedger::new();
        ledger
            .begin("t1", &[StepLabel::Transcribe, StepLabel::Translate])
            .await;
        // Weights normalize to 40/55 and 15/55.
        ledger
            .update("t1", StepLabel::Transcribe, StepUpdate::progress(1.0))
            .await;

        let snap = ledger.snapshot("t1").await.unwrap();
        let expected = 0.40 / 0.55 * 100.0;
        assert!((snap.overall_percent - expected).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_log_ring_bounded() {
        let ledger = ProgressLedger::with_log_capacity(3);
        ledger.begin("t1", &[StepLabel::Fetch]).await;
        for i in 0..5 {
            ledger.log("t1", format!("line {i}")).await;
        }
        let snap = ledger.snapshot("t1").await.unwrap();
        assert_eq!(snap.logs_tail, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_indeterminate_pseudo_progress_capped() {
        let ledger = ProgressLedger::new();
        ledger.begin("t1", &[StepLabel::Fetch]).await;
        ledger
            .update(
                "t1",
                StepLabel::Fetch,
                StepUpdate {
                    status: Some(StepStatus::InProgress),
                    indeterminate: Some(true),
                    ..Default::default()
                },
            )
            .await;

        let snap = ledger.snapshot("t1").await.unwrap();
        assert!(snap.steps[0].progress >= 0.0);
        assert!(snap.steps[0].progress <= 0.95);
    }

    #[tokio::test]
    async fn test_timing_counter_accumulates() {
        let ledger = ProgressLedger::new();
        ledger.begin("t1", &[StepLabel::Translate]).await;
        ledger
            .add_timing("t1", "provider_calls", Duration::from_millis(120))
            .await;
        ledger
            .add_timing("t1", "provider_calls", Duration::from_millis(80))
            .await;
        let snap = ledger.snapshot("t1").await.unwrap();
        assert_eq!(snap.timing_ms["provider_calls"], 200);
    }

    #[tokio::test]
    async fn test_snapshot_unknown_task() {
        let ledger = ProgressLedger::new();
        assert!(ledger.snapshot("nope").await.is_none());
    }
}
