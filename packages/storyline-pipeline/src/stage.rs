use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use storyline_store::Document;

use crate::error::{PipelineError, Result};

/// A named transformation applied to one story (pluggable stages)
///
/// `process` returns a partial update: the fields to merge into the story,
/// not a replacement. Implementations may fail with any error type.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage identifier, as used in stage sequences
    fn name(&self) -> &str;

    /// Compute the fields this stage contributes to the story
    async fn process(&self, story: &Document) -> anyhow::Result<Document>;
}

/// Maps stage identifiers to stage instances, populated at startup
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own name (replaces any previous one)
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.name().to_string(), stage);
        self
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Stage>> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Resolve a stage and run it, wrapping stage failures with the stage name
pub async fn run_stage(registry: &StageRegistry, name: &str, story: &Document) -> Result<Document> {
    let stage = registry.resolve(name)?;
    stage
        .process(story)
        .await
        .map_err(|e| PipelineError::StageExecutionFailed {
            stage: name.to_string(),
            message: format!("{:#}", e),
        })
}
