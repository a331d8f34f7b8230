//! Outbound stage work: the message handed from a driver to an executor

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storyline_store::Document;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// One unit of stage work: apply `stage_name` (index `stage_index`) to `story`.
///
/// The task owns its story snapshot. Nothing the dispatcher does after
/// enqueueing can change what the executor sees. The snapshot never carries
/// the store identity; `origin_id` keeps it next to the snapshot so the
/// executor can write the result back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTask {
    pub task_id: Uuid,
    pub stage_index: usize,
    pub stage_name: String,
    pub story: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl StageTask {
    pub fn new(stage_index: usize, stage_name: impl Into<String>, story: Document) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            stage_index,
            stage_name: stage_name.into(),
            story,
            origin_id: None,
        }
    }

    pub fn with_origin(mut self, origin_id: Option<String>) -> Self {
        self.origin_id = origin_id;
        self
    }
}

/// Fire-and-forget handoff to an asynchronous executor (at-least-once)
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn enqueue(&self, task: StageTask) -> Result<()>;
}

/// TaskSink backed by an unbounded tokio channel, drained by a `WorkerPool`
#[derive(Clone)]
pub struct ChannelTaskSink {
    sender: mpsc::UnboundedSender<StageTask>,
}

impl ChannelTaskSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl TaskSink for ChannelTaskSink {
    async fn enqueue(&self, task: StageTask) -> Result<()> {
        self.sender
            .send(task)
            .map_err(|e| PipelineError::dispatch(format!("executor channel closed: {}", e)))
    }
}
