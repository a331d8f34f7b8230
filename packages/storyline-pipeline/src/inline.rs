//! Inline mode: one story, every stage, one write.
//!
//! The story is read from a `StorySource`, run through all stages on a
//! working copy, marked `_pipeline.status = "done"` and written back once.
//! If any stage fails, nothing is written and the source is left as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use storyline_store::Document;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::driver::{PipelineDriver, StageSequence};
use crate::error::{PipelineError, Result};
use crate::metadata::{is_done, merge_update, set_metadata, PipelineMetadata};
use crate::stage::StageRegistry;

/// Byte source holding a single story
#[async_trait]
pub trait StorySource: Send + Sync {
    async fn load(&self) -> Result<Document>;

    async fn save(&self, story: &Document) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Story stored as a JSON object in a file
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StorySource for JsonFileSource {
    async fn load(&self) -> Result<Document> {
        let bytes = tokio::fs::read(&self.path).await?;
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(story) => Ok(story),
            other => Err(PipelineError::invalid_story(format!(
                "{} does not hold a JSON object (found {})",
                self.path.display(),
                json_type(&other)
            ))),
        }
    }

    async fn save(&self, story: &Document) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(story)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineOutcome {
    /// Story already carried the terminal marker; not rewritten
    AlreadyDone,
    Completed { stages_run: usize },
}

pub struct InlineRunner {
    stages: StageSequence,
    registry: Arc<StageRegistry>,
}

impl InlineRunner {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            stages: StageSequence::new(),
            registry,
        }
    }

    pub fn with_stages<I, S>(registry: Arc<StageRegistry>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: StageSequence::from_names(names),
            registry,
        }
    }

    pub fn from_config(config: &PipelineConfig, registry: Arc<StageRegistry>) -> Self {
        Self {
            stages: config.stage_sequence(),
            registry,
        }
    }

    /// Run every stage over the story held by `source` and save it once.
    ///
    /// All stage names are resolved before the first stage runs.
    pub async fn process_one(&self, source: &dyn StorySource) -> Result<InlineOutcome> {
        let mut story = source.load().await?;
        if is_done(&story)? {
            info!("{} already processed, skipping", source.describe());
            return Ok(InlineOutcome::AlreadyDone);
        }

        let resolved = self
            .stages
            .iter()
            .map(|name| self.registry.resolve(name).map(|stage| (name, stage)))
            .collect::<Result<Vec<_>>>()?;

        for (name, stage) in &resolved {
            debug!("Applying {} to {}", name, source.describe());
            let partial = stage
                .process(&story)
                .await
                .map_err(|e| PipelineError::StageExecutionFailed {
                    stage: name.to_string(),
                    message: format!("{:#}", e),
                })?;
            merge_update(&mut story, name, partial);
        }

        set_metadata(&mut story, PipelineMetadata::Done);
        source.save(&story).await?;

        info!(
            "{}: {} stages applied",
            source.describe(),
            resolved.len()
        );
        Ok(InlineOutcome::Completed {
            stages_run: resolved.len(),
        })
    }
}

/// Inline mode has no store to query, so `run` fails at the first stage
#[async_trait]
impl PipelineDriver for InlineRunner {
    fn driver_name(&self) -> &'static str {
        "InlineRunner"
    }

    fn stages(&self) -> &StageSequence {
        &self.stages
    }

    fn stages_mut(&mut self) -> &mut StageSequence {
        &mut self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::stage::Stage;
    use serde_json::json;
    use std::sync::Mutex;

    struct Insert(&'static str, Value);

    #[async_trait]
    impl Stage for Insert {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&self, _story: &Document) -> anyhow::Result<Document> {
            let mut out = Document::new();
            out.insert(self.0.to_lowercase(), self.1.clone());
            Ok(out)
        }
    }

    /// Sees what earlier stages merged
    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn process(&self, story: &Document) -> anyhow::Result<Document> {
            let mut out = Document::new();
            out.insert("echo".into(), story.get("a").cloned().unwrap_or(Value::Null));
            Ok(out)
        }
    }

    struct Fails;

    #[async_trait]
    impl Stage for Fails {
        fn name(&self) -> &str {
            "Fails"
        }

        async fn process(&self, _story: &Document) -> anyhow::Result<Document> {
            anyhow::bail!("model timed out")
        }
    }

    struct MemorySource {
        story: Mutex<Document>,
        saves: Mutex<usize>,
    }

    impl MemorySource {
        fn new(value: Value) -> Self {
            Self {
                story: Mutex::new(value.as_object().cloned().unwrap()),
                saves: Mutex::new(0),
            }
        }

        fn story(&self) -> Value {
            Value::Object(self.story.lock().unwrap().clone())
        }

        fn saves(&self) -> usize {
            *self.saves.lock().unwrap()
        }
    }

    #[async_trait]
    impl StorySource for MemorySource {
        async fn load(&self) -> Result<Document> {
            Ok(self.story.lock().unwrap().clone())
        }

        async fn save(&self, story: &Document) -> Result<()> {
            *self.story.lock().unwrap() = story.clone();
            *self.saves.lock().unwrap() += 1;
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn registry() -> Arc<StageRegistry> {
        Arc::new(
            StageRegistry::new()
                .with(Arc::new(Insert("A", json!(true))))
                .with(Arc::new(Echo))
                .with(Arc::new(Fails)),
        )
    }

    #[tokio::test]
    async fn test_process_one_marks_done() {
        let runner = InlineRunner::with_stages(registry(), ["A"]);
        let source = MemorySource::new(json!({ "y": 2 }));

        let outcome = runner.process_one(&source).await.unwrap();

        assert_eq!(outcome, InlineOutcome::Completed { stages_run: 1 });
        assert_eq!(
            source.story(),
            json!({ "y": 2, "a": true, "_pipeline": { "status": "done" } })
        );
        assert_eq!(source.saves(), 1);
    }

    #[tokio::test]
    async fn test_later_stages_see_earlier_output() {
        let runner = InlineRunner::with_stages(registry(), ["A", "Echo"]);
        let source = MemorySource::new(json!({}));

        runner.process_one(&source).await.unwrap();

        assert_eq!(source.story()["echo"], json!(true));
        assert_eq!(source.saves(), 1);
    }

    #[tokio::test]
    async fn test_done_story_is_not_rewritten() {
        let runner = InlineRunner::with_stages(registry(), ["A"]);
        let source = MemorySource::new(json!({ "y": 2, "_pipeline": { "status": "done" } }));

        let outcome = runner.process_one(&source).await.unwrap();

        assert_eq!(outcome, InlineOutcome::AlreadyDone);
        assert_eq!(source.saves(), 0);
        assert!(source.story().get("a").is_none());
    }

    #[tokio::test]
    async fn test_stage_failure_writes_nothing() {
        let runner = InlineRunner::with_stages(registry(), ["A", "Fails"]);
        let source = MemorySource::new(json!({ "y": 2 }));

        let err = runner.process_one(&source).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StageExecutionFailed { ref stage, .. } if stage == "Fails"
        ));
        assert_eq!(source.saves(), 0);
        assert_eq!(source.story(), json!({ "y": 2 }));
    }

    #[tokio::test]
    async fn test_unknown_stage_runs_nothing() {
        let runner = InlineRunner::with_stages(registry(), ["A", "Missing"]);
        let source = MemorySource::new(json!({ "y": 2 }));

        let err = runner.process_one(&source).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Resolution);
        assert_eq!(source.saves(), 0);
    }

    #[tokio::test]
    async fn test_malformed_metadata_is_rejected() {
        let runner = InlineRunner::with_stages(registry(), ["A"]);

        for value in [
            json!({ "y": 2, "_pipeline": "done" }),
            json!({ "y": 2, "_pipeline": { "next_stage": "0" } }),
        ] {
            let source = MemorySource::new(value.clone());
            let err = runner.process_one(&source).await.unwrap_err();

            assert_eq!(err.category(), ErrorCategory::Data);
            assert_eq!(source.saves(), 0);
            assert_eq!(source.story(), value);
        }
    }

    #[tokio::test]
    async fn test_queued_metadata_is_replaced() {
        let runner = InlineRunner::with_stages(registry(), ["A"]);
        let source = MemorySource::new(json!({ "_pipeline": { "next_stage": 1 } }));

        runner.process_one(&source).await.unwrap();

        assert_eq!(source.story()["_pipeline"], json!({ "status": "done" }));
    }

    #[tokio::test]
    async fn test_run_is_unsupported() {
        let runner = InlineRunner::with_stages(registry(), ["A"]);
        let err = runner.run(None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Unsupported {
                driver: "InlineRunner",
                operation: "stories_for_stage"
            }
        ));
    }

    #[tokio::test]
    async fn test_json_file_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("story.json");
        std::fs::write(&path, "[1, 2]").unwrap();

        let err = JsonFileSource::new(&path).load().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Data);
    }

    #[tokio::test]
    async fn test_json_file_save_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("story.json");
        std::fs::write(&path, r#"{"y": 2}"#).unwrap();
        let source = JsonFileSource::new(&path);

        let mut story = source.load().await.unwrap();
        story.insert("z".into(), json!(3));
        source.save(&story).await.unwrap();

        assert_eq!(source.load().await.unwrap(), story);
        assert!(!dir.path().join("story.json.tmp").exists());
    }
}
