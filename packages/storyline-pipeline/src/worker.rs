//! Executor side of queued mode.
//!
//! A `StageWorker` applies one `StageTask`: it runs the named stage on the
//! snapshot, then merges the output and advances `next_stage` in a single
//! conditional store update (`next_stage` must still equal the task's stage
//! index). A task whose stage was already applied matches nothing and is
//! reported as `Stale`, which is how duplicate dispatches are absorbed.
//!
//! `WorkerPool` drains a `ChannelTaskSink` receiver on tokio tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use storyline_store::{Filter, StoryStore, Update};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::driver::StageSequence;
use crate::error::{PipelineError, Result};
use crate::metadata::{
    next_stage_path, strip_reserved, PipelineMetadata, ID_KEY, METADATA_KEY, STORY_ID_KEY,
};
use crate::stage::{run_stage, StageRegistry};
use crate::task::StageTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Output merged, `next_stage` moved to `advanced_to`
    Applied { advanced_to: usize },
    /// Stage already applied (or story gone), nothing written
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub applied: u64,
    pub stale: u64,
    pub failed: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<WorkerOutcome>) {
        match result {
            Ok(WorkerOutcome::Applied { .. }) => self.applied += 1,
            Ok(WorkerOutcome::Stale) => self.stale += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct StageWorker {
    store: Arc<dyn StoryStore>,
    registry: Arc<StageRegistry>,
    stages: StageSequence,
}

impl StageWorker {
    /// `stages` must be the same sequence the dispatching runner uses
    pub fn new(store: Arc<dyn StoryStore>, registry: Arc<StageRegistry>, stages: StageSequence) -> Self {
        Self {
            store,
            registry,
            stages,
        }
    }

    /// Filter selecting the task's story while it still waits for this stage
    fn pending_filter(task: &StageTask) -> Result<Filter> {
        let target = match (&task.origin_id, task.story.get(STORY_ID_KEY)) {
            (Some(id), _) => Filter::eq(ID_KEY, json!(id)),
            (None, Some(key)) => Filter::eq(STORY_ID_KEY, key.clone()),
            (None, None) => {
                return Err(PipelineError::invalid_story(format!(
                    "task {} carries neither an origin id nor {}",
                    task.task_id, STORY_ID_KEY
                )))
            }
        };
        Ok(target.and(Filter::eq(next_stage_path(), json!(task.stage_index))))
    }

    pub async fn apply(&self, task: &StageTask) -> Result<WorkerOutcome> {
        let expected = self.stages.require(task.stage_index)?;
        if expected != task.stage_name {
            return Err(PipelineError::SequenceMismatch {
                index: task.stage_index,
                expected: expected.to_string(),
                found: task.stage_name.clone(),
            });
        }

        match PipelineMetadata::from_story(&task.story)? {
            Some(meta) if meta.is_terminal(self.stages.stage_count()) => {
                return Err(PipelineError::invalid_story(format!(
                    "task {} carries a story that already finished the pipeline",
                    task.task_id
                )))
            }
            Some(PipelineMetadata::Queued { next_stage }) if next_stage != task.stage_index => {
                return Err(PipelineError::invalid_story(format!(
                    "task {} targets stage {} but its story is at stage {}",
                    task.task_id, task.stage_index, next_stage
                )))
            }
            _ => {}
        }

        let pending = Self::pending_filter(task)?;
        if self.store.count(&pending).await? == 0 {
            info!(
                "Task {}: {} already applied, skipping",
                task.task_id, task.stage_name
            );
            return Ok(WorkerOutcome::Stale);
        }

        let partial = run_stage(&self.registry, &task.stage_name, &task.story).await?;
        let advanced_to = task.stage_index + 1;
        let update = Update::merge(&strip_reserved(&task.stage_name, partial)).and_set(
            METADATA_KEY,
            PipelineMetadata::Queued {
                next_stage: advanced_to,
            }
            .to_value(),
        );

        // Conditional on next_stage: a concurrent duplicate that got here
        // first leaves nothing to match
        let updated = self.store.update_many(&pending, &update).await?;
        if updated == 0 {
            warn!(
                "Task {}: {} was applied concurrently, result dropped",
                task.task_id, task.stage_name
            );
            return Ok(WorkerOutcome::Stale);
        }

        info!(
            "Task {}: {} applied, next_stage -> {}",
            task.task_id, task.stage_name, advanced_to
        );
        Ok(WorkerOutcome::Applied { advanced_to })
    }

    /// Apply every task currently waiting in the receiver, one at a time.
    ///
    /// Failures are logged and counted; they never stop the drain.
    pub async fn drain(&self, receiver: &mut UnboundedReceiver<StageTask>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        while let Ok(task) = receiver.try_recv() {
            let result = self.apply(&task).await;
            if let Err(e) = &result {
                error!("Task {} ({}) failed: {}", task.task_id, task.stage_name, e);
            }
            stats.record(&result);
        }
        stats
    }
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<WorkerOutcome>) {
        let counter = match result {
            Ok(WorkerOutcome::Applied { .. }) => &self.applied,
            Ok(WorkerOutcome::Stale) => &self.stale,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Bounded pool of tokio tasks applying stage tasks from a channel.
///
/// Runs until every sender is dropped or `shutdown` is called. Tasks still
/// queued at shutdown are dropped; their stories stay eligible and are
/// dispatched again by the next `run`.
pub struct WorkerPool {
    worker_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerStats>,
}

impl WorkerPool {
    pub fn spawn(
        worker: Arc<StageWorker>,
        mut receiver: UnboundedReceiver<StageTask>,
        concurrency: usize,
    ) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        let cancel = CancellationToken::new();
        let permits = concurrency.max(1);

        let token = cancel.clone();
        let id = worker_id.clone();
        let handle = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(permits));
            let counters = Arc::new(Counters::default());
            info!("{}: started with {} slots", id, permits);

            loop {
                let task = tokio::select! {
                    _ = token.cancelled() => break,
                    task = receiver.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let worker = worker.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = worker.apply(&task).await;
                    if let Err(e) = &result {
                        error!("Task {} ({}) failed: {}", task.task_id, task.stage_name, e);
                    }
                    counters.record(&result);
                });
            }

            // Wait for in-flight tasks to release their slots
            let _drained = semaphore.acquire_many(permits as u32).await;
            let stats = counters.snapshot();
            info!(
                "{}: stopped - {} applied, {} stale, {} failed",
                id, stats.applied, stats.stale, stats.failed
            );
            stats
        });

        Self {
            worker_id,
            cancel,
            handle,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop taking new tasks; in-flight tasks still finish
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pool to stop and return what it did
    pub async fn join(self) -> Result<WorkerStats> {
        self.handle
            .await
            .map_err(|e| PipelineError::dispatch(format!("{} aborted: {}", self.worker_id, e)))
    }
}
