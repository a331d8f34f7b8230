//! Storyline pipeline - staged enrichment of story documents
//!
//! A pipeline is an ordered list of named stages. Each stage reads a story
//! and returns a partial update that is merged into it. Two drivers share the
//! same `run` loop:
//!
//! - `InlineRunner`: one story, all stages, one atomic write, marked
//!   `_pipeline.status = "done"`.
//! - `QueuedRunner`: many stories in a `StoryStore`, one stage at a time.
//!   Progress lives in `_pipeline.next_stage`; stage work is handed to a
//!   `TaskSink` and applied by a `StageWorker`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (sink, receiver) = ChannelTaskSink::new();
//! let mut runner = QueuedRunner::new(store.clone(), Arc::new(sink));
//! runner.add_stage("Tokenize");
//!
//! let pool = WorkerPool::spawn(
//!     Arc::new(StageWorker::new(store, registry, runner.stages().clone())),
//!     receiver,
//!     4,
//! );
//! runner.run(Some(500)).await?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod inline;
pub mod metadata;
pub mod queued;
pub mod stage;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, PipelineConfig, RunMode, StoreConfig};
pub use driver::{PipelineDriver, RunReport, StageRunSummary, StageSequence};
pub use error::{ErrorCategory, PipelineError, Result};
pub use inline::{InlineOutcome, InlineRunner, JsonFileSource, StorySource};
pub use metadata::PipelineMetadata;
pub use queued::QueuedRunner;
pub use stage::{Stage, StageRegistry};
pub use task::{ChannelTaskSink, StageTask, TaskSink};
pub use telemetry::init_tracing;
pub use worker::{StageWorker, WorkerOutcome, WorkerPool, WorkerStats};

pub use storyline_store::{Document, StoryStore};
