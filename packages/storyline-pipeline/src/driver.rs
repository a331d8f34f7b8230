use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storyline_store::Document;
use tracing::{error, info};

use crate::error::{PipelineError, Result};

/// Ordered stage identifiers, fixed for the lifetime of a driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSequence {
    names: Vec<String>,
}

impl StageSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a stage identifier. Resolution is not checked here.
    pub fn add_stage(&mut self, name: impl Into<String>) {
        self.names.push(name.into());
    }

    pub fn stage_count(&self) -> usize {
        self.names.len()
    }

    pub fn stage_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Stage name at `index`, or a programming error when out of range
    pub fn require(&self, index: usize) -> Result<&str> {
        self.stage_name(index)
            .ok_or(PipelineError::StageIndexOutOfRange {
                index,
                stage_count: self.stage_count(),
            })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Stories dispatched for one stage index during a `run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRunSummary {
    pub index: usize,
    pub name: String,
    pub dispatched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<StageRunSummary>,
}

impl RunReport {
    pub fn total_dispatched(&self) -> usize {
        self.stages.iter().map(|s| s.dispatched).sum()
    }
}

/// Shared stage-progression contract.
///
/// `run` walks stage indices in order and, for each, asks which stories are
/// eligible and dispatches them one by one. Specializations decide what
/// "eligible" and "dispatch" mean. A specialization that does not provide
/// them fails at the first call with `PipelineError::Unsupported`.
#[async_trait]
pub trait PipelineDriver: Send + Sync {
    /// Name used in logs and errors
    fn driver_name(&self) -> &'static str;

    fn stages(&self) -> &StageSequence;

    fn stages_mut(&mut self) -> &mut StageSequence;

    fn add_stage(&mut self, name: &str) {
        self.stages_mut().add_stage(name);
    }

    fn stage_count(&self) -> usize {
        self.stages().stage_count()
    }

    /// Stories ready for stage `index`, at most `limit` of them
    async fn stories_for_stage(&self, _index: usize, _limit: Option<usize>) -> Result<Vec<Document>> {
        error!("{} does not implement stories_for_stage", self.driver_name());
        Err(PipelineError::Unsupported {
            driver: self.driver_name(),
            operation: "stories_for_stage",
        })
    }

    /// Apply (or hand off) stage `index` for one eligible story
    async fn dispatch(&self, _story: Document, _index: usize) -> Result<()> {
        error!("{} does not implement dispatch", self.driver_name());
        Err(PipelineError::Unsupported {
            driver: self.driver_name(),
            operation: "dispatch",
        })
    }

    /// Discover and dispatch eligible stories, stage by stage.
    ///
    /// Stage `i + 1` is not queried until every story discovered for stage
    /// `i` has been dispatched. Any error aborts the run and is returned.
    async fn run(&self, limit: Option<usize>) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut summaries = Vec::with_capacity(self.stage_count());

        for (idx, name) in self.stages().iter().enumerate() {
            info!("  Stage {}: {}", idx, name);

            let stories = self.stories_for_stage(idx, limit).await?;
            let mut dispatched = 0;
            for story in stories {
                self.dispatch(story, idx).await?;
                dispatched += 1;
            }

            info!("    {} stories to queue", dispatched);
            summaries.push(StageRunSummary {
                index: idx,
                name: name.to_string(),
                dispatched,
            });
        }

        Ok(RunReport {
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            stages: summaries,
        })
    }
}
