//! Process-wide task registry.
//!
//! Owns the mapping from opaque task ids to task records, the worker pool
//! that executes pipeline drivers, the durable `meta.json` snapshots and
//! the TTL sweeper that garbage-collects terminal tasks together with
//! their artifact directories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, TaskError, VidsubError};
use crate::media::MediaMetadata;
use crate::pipeline::{ProgressLedger, Step};
use crate::task::{ArtifactKind, Choices, TaskKind, TaskResult, TaskSnapshot, TaskState};
use crate::task::token::DownloadGuard;

/// What `get_status` returns to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub steps: Vec<Step>,
    pub overall_percent: f32,
    pub logs_tail: Vec<String>,
    pub media_metadata: Option<MediaMetadata>,
    pub choices: Option<Choices>,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
}

struct TaskMutable {
    state: TaskState,
    choices: Choices,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    source_metadata: Option<MediaMetadata>,
    result: Option<TaskResult>,
    error: Option<TaskError>,
}

pub struct TaskHandle {
    pub id: String,
    pub kind: TaskKind,
    pub cancel: CancellationToken,
    state: Mutex<TaskMutable>,
}

impl TaskHandle {
    async fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().await;
        TaskSnapshot {
            task_id: self.id.clone(),
            kind: self.kind,
            state: state.state,
            choices: state.choices.clone(),
            created_at: state.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            source_metadata: state.source_metadata.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
        }
    }
}

pub struct TaskRegistry {
    inner: RwLock<HashMap<String, Arc<TaskHandle>>>,
    ledger: Arc<ProgressLedger>,
    workroot: PathBuf,
    ttl: Duration,
    workers: Arc<Semaphore>,
}

impl TaskRegistry {
    pub fn new(config: &Config, ledger: Arc<ProgressLedger>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ledger,
            workroot: config.work_dir.clone(),
            ttl: Duration::from_secs(config.task_ttl_seconds),
            workers: Arc::new(Semaphore::new(config.worker_count)),
        }
    }

    /// Register a new task in `pending` state and create its artifact
    /// directory. Returns the opaque task id.
    pub async fn create(&self, kind: TaskKind, choices: Choices) -> Result<String> {
        let task_id = Uuid::new_v4().simple().to_string();
        let workdir = self.workdir(&task_id);
        tokio::fs::create_dir_all(&workdir).await?;

        let handle = Arc::new(TaskHandle {
            id: task_id.clone(),
            kind,
            cancel: CancellationToken::new(),
            state: Mutex::new(TaskMutable {
                state: TaskState::Pending,
                choices,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                source_metadata: None,
                result: None,
                error: None,
            }),
        });

        self.write_meta(&handle).await;
        self.inner
            .write()
            .await
            .insert(task_id.clone(), handle.clone());

        debug!("created task {task_id} ({kind:?})");
        Ok(task_id)
    }

    /// Per-task artifact directory.
    pub fn workdir(&self, task_id: &str) -> PathBuf {
        self.workroot.join(task_id)
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.inner.read().await.get(task_id).cloned()
    }

    pub async fn set_source_metadata(&self, task_id: &str, metadata: MediaMetadata) {
        if let Some(handle) = self.get(task_id).await {
            handle.state.lock().await.source_metadata = Some(metadata);
            self.write_meta(&handle).await;
        }
    }

    /// Attach the work future to the worker pool. The task stays `pending`
    /// until a worker picks it up; the returned join handle resolves when
    /// the task reaches a terminal state.
    pub async fn submit<F>(
        self: &Arc<Self>,
        task_id: &str,
        work: F,
    ) -> Result<tokio::task::JoinHandle<()>>
    where
        F: std::future::Future<Output = Result<TaskResult>> + Send + 'static,
    {
        let handle = self
            .get(task_id)
            .await
            .ok_or_else(|| VidsubError::NotFound(task_id.to_string()))?;
        let registry = self.clone();
        let workers = self.workers.clone();

        Ok(tokio::spawn(async move {
            // Queue for a worker slot; cancellation while queued is honored.
            let permit = tokio::select! {
                permit = workers.acquire_owned() => permit.expect("semaphore closed"),
                _ = handle.cancel.cancelled() => {
                    registry.finish(&handle, Err(VidsubError::Cancelled)).await;
                    return;
                }
            };
            let _permit = permit;

            {
                let mut state = handle.state.lock().await;
                if state.state.is_terminal() {
                    return;
                }
                state.state = TaskState::Running;
                state.started_at = Some(Utc::now());
            }
            registry.write_meta(&handle).await;
            info!("task {} running", handle.id);

            let outcome = work.await;
            registry.finish(&handle, outcome).await;
        }))
    }

    /// Apply the single terminal transition and persist it.
    async fn finish(&self, handle: &Arc<TaskHandle>, outcome: Result<TaskResult>) {
        let mut remove_artifacts = false;
        let mut failed = false;
        {
            let mut state = handle.state.lock().await;
            if state.state.is_terminal() {
                return;
            }
            state.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    state.state = TaskState::Succeeded;
                    if state.source_metadata.is_none() {
                        state.source_metadata = result.media_metadata.clone();
                    }
                    state.result = Some(result);
                    info!("task {} succeeded", handle.id);
                }
                Err(VidsubError::Cancelled) => {
                    state.state = TaskState::Cancelled;
                    remove_artifacts = true;
                    info!("task {} cancelled", handle.id);
                }
                Err(e) => {
                    state.state = TaskState::Failed;
                    failed = true;
                    warn!("task {} failed: {e}", handle.id);
                    state.error = Some(TaskError::from_error(&e));
                }
            }
        }

        if failed {
            self.ledger.fail_active_steps(&handle.id).await;
        }

        if remove_artifacts {
            // A cancelled task keeps its record but not its artifacts.
            let workdir = self.workdir(&handle.id);
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            let _ = tokio::fs::create_dir_all(&workdir).await;
        }
        self.write_meta(handle).await;
    }

    /// Set the cancel token. Safe in any state; terminal tasks are no-ops.
    pub async fn cancel(&self, task_id: &str) {
        if let Some(handle) = self.get(task_id).await {
            let state = handle.state.lock().await;
            if !state.state.is_terminal() {
                drop(state);
                info!("cancelling task {task_id}");
                handle.cancel.cancel();
            }
        }
    }

    /// Observable status. Unknown ids report `pending` so clients may poll
    /// optimistically before the record lands.
    pub async fn get_status(&self, task_id: &str) -> TaskStatus {
        let Some(handle) = self.get(task_id).await else {
            return TaskStatus {
                task_id: task_id.to_string(),
                state: TaskState::Pending,
                steps: Vec::new(),
                overall_percent: 0.0,
                logs_tail: Vec::new(),
                media_metadata: None,
                choices: None,
                result: None,
                error: None,
            };
        };

        let snapshot = handle.snapshot().await;
        let progress = self.ledger.snapshot(task_id).await;
        let (steps, overall_percent, logs_tail) = match progress {
            Some(p) => (p.steps, p.overall_percent, p.logs_tail),
            None => (Vec::new(), 0.0, Vec::new()),
        };

        TaskStatus {
            task_id: snapshot.task_id,
            state: snapshot.state,
            steps,
            overall_percent,
            logs_tail,
            media_metadata: snapshot.source_metadata,
            choices: Some(snapshot.choices),
            result: snapshot.result,
            error: snapshot.error,
        }
    }

    /// Issue a download token. Only succeeded tasks may hand out
    /// artifacts, and only ones they actually produced.
    pub async fn issue_download(
        &self,
        guard: &DownloadGuard,
        task_id: &str,
        artifact: ArtifactKind,
        ttl: Duration,
    ) -> Result<String> {
        let handle = self
            .get(task_id)
            .await
            .ok_or_else(|| VidsubError::NotFound(task_id.to_string()))?;
        let state = handle.state.lock().await;
        if state.state != TaskState::Succeeded {
            return Err(VidsubError::InvalidInput(format!(
                "task {task_id} has not succeeded"
            )));
        }
        let produced = state
            .result
            .as_ref()
            .map(|r| r.artifacts.contains_key(&artifact))
            .unwrap_or(false);
        if !produced {
            return Err(VidsubError::NotFound(format!(
                "task {task_id} has no {} artifact",
                artifact.as_str()
            )));
        }
        Ok(guard.issue(task_id, artifact, ttl))
    }

    /// Drop terminal tasks past their TTL, together with their artifact
    /// directories and ledger entries.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let inner = self.inner.read().await;
            for (id, handle) in inner.iter() {
                let state = handle.state.lock().await;
                if let (true, Some(finished)) = (state.state.is_terminal(), state.finished_at) {
                    let age = now.signed_duration_since(finished);
                    if age.num_seconds() >= self.ttl.as_secs() as i64 {
                        expired.push(id.clone());
                    }
                }
            }
        }

        for id in expired {
            info!("sweeping expired task {id}");
            self.inner.write().await.remove(&id);
            self.ledger.remove(&id).await;
            let _ = tokio::fs::remove_dir_all(self.workdir(&id)).await;
        }
    }

    /// Background sweeper loop.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    async fn write_meta(&self, handle: &Arc<TaskHandle>) {
        let snapshot = handle.snapshot().await;
        let path = self.workdir(&handle.id).join("meta.json");
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("failed to write {}: {e}", path.display());
                }
            }
            Err(e) => warn!("failed to serialize task snapshot: {e}"),
        }
    }
}
