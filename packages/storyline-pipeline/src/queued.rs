//! Queued mode: many stories, one stage at a time, progress kept in the store.
//!
//! The runner never advances `next_stage` itself. It hands each eligible story
//! to a `TaskSink` and whatever executes the task (see `worker`) merges the
//! stage output and advances the pointer in one store update. Until that
//! happens the story stays eligible, so repeated or concurrent `run` calls may
//! dispatch the same story/stage pair more than once.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use storyline_store::{Document, Filter, StoryStore, Update};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::driver::{PipelineDriver, StageSequence};
use crate::error::Result;
use crate::metadata::{next_stage_path, PipelineMetadata, ID_KEY, METADATA_KEY, STORY_ID_KEY};
use crate::task::{StageTask, TaskSink};

pub struct QueuedRunner {
    stages: StageSequence,
    store: Arc<dyn StoryStore>,
    sink: Arc<dyn TaskSink>,
}

impl QueuedRunner {
    pub fn new(store: Arc<dyn StoryStore>, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            stages: StageSequence::new(),
            store,
            sink,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        store: Arc<dyn StoryStore>,
        sink: Arc<dyn TaskSink>,
    ) -> Self {
        Self {
            stages: config.stage_sequence(),
            store,
            sink,
        }
    }

    pub fn store(&self) -> &Arc<dyn StoryStore> {
        &self.store
    }

    /// Give every story without pipeline metadata `next_stage = 0`.
    ///
    /// Additive only: stories that already carry metadata are untouched, so
    /// this is safe to call repeatedly and from concurrent runs.
    ///
    /// # Returns
    ///
    /// Number of stories initialized by this call
    pub async fn init_stories_with_metadata(&self) -> Result<u64> {
        // Advisory indexes for the eligibility query
        self.store.create_index(METADATA_KEY).await?;
        self.store.create_index(&next_stage_path()).await?;
        self.store.create_index(STORY_ID_KEY).await?;

        let initialized = self
            .store
            .update_many(
                &Filter::missing(METADATA_KEY),
                &Update::set(METADATA_KEY, PipelineMetadata::initial().to_value()),
            )
            .await?;
        if initialized > 0 {
            info!("Initialized pipeline metadata on {} stories", initialized);
        }
        Ok(initialized)
    }
}

#[async_trait]
impl PipelineDriver for QueuedRunner {
    fn driver_name(&self) -> &'static str {
        "QueuedRunner"
    }

    fn stages(&self) -> &StageSequence {
        &self.stages
    }

    fn stages_mut(&mut self) -> &mut StageSequence {
        &mut self.stages
    }

    async fn stories_for_stage(&self, index: usize, limit: Option<usize>) -> Result<Vec<Document>> {
        self.stages.require(index)?;
        self.init_stories_with_metadata().await?;

        let stories = self
            .store
            .find(&Filter::eq(next_stage_path(), json!(index)), limit)
            .await?;
        debug!("Stage {}: {} eligible stories", index, stories.len());
        Ok(stories)
    }

    async fn dispatch(&self, mut story: Document, index: usize) -> Result<()> {
        let stage_name = self.stages.require(index)?;

        // Store identity is not part of the snapshot
        let origin_id = match story.remove(ID_KEY) {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };

        let task = StageTask::new(index, stage_name, story).with_origin(origin_id);
        debug!(
            "Queueing task {} ({} #{})",
            task.task_id, task.stage_name, task.stage_index
        );
        self.sink.enqueue(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use std::sync::Mutex;
    use storyline_store::MemoryStoryStore;

    #[derive(Default)]
    struct RecordingSink {
        tasks: Mutex<Vec<StageTask>>,
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn enqueue(&self, task: StageTask) -> Result<()> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn runner_with(stories: Vec<Value>) -> (QueuedRunner, Arc<MemoryStoryStore>, Arc<RecordingSink>) {
        let store = Arc::new(MemoryStoryStore::new());
        store
            .insert_many(stories.into_iter().map(doc).collect())
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut runner = QueuedRunner::new(store.clone(), sink.clone());
        runner.add_stage("A");
        runner.add_stage("B");
        (runner, store, sink)
    }

    #[tokio::test]
    async fn test_init_is_additive_and_idempotent() {
        let (runner, store, _) = runner_with(vec![
            json!({ "stories_id": 1 }),
            json!({ "stories_id": 2, "_pipeline": { "next_stage": 1 } }),
        ])
        .await;

        assert_eq!(runner.init_stories_with_metadata().await.unwrap(), 1);
        let first = store.find(&Filter::All, None).await.unwrap();
        assert_eq!(runner.init_stories_with_metadata().await.unwrap(), 0);
        let second = store.find(&Filter::All, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0]["_pipeline"], json!({ "next_stage": 0 }));
        assert_eq!(first[1]["_pipeline"], json!({ "next_stage": 1 }));
        assert_eq!(
            store.indexes(),
            vec!["_pipeline", "_pipeline.next_stage", "stories_id"]
        );
    }

    #[tokio::test]
    async fn test_stories_for_stage_selects_by_next_stage() {
        let (runner, _, _) = runner_with(vec![
            json!({ "stories_id": 1 }),
            json!({ "stories_id": 2, "_pipeline": { "next_stage": 1 } }),
            json!({ "stories_id": 3, "_pipeline": { "next_stage": 2 } }),
        ])
        .await;

        let stage0 = runner.stories_for_stage(0, None).await.unwrap();
        let stage1 = runner.stories_for_stage(1, None).await.unwrap();

        assert_eq!(stage0.len(), 1);
        assert_eq!(stage0[0]["stories_id"], json!(1));
        assert_eq!(stage1.len(), 1);
        assert_eq!(stage1[0]["stories_id"], json!(2));
    }

    #[tokio::test]
    async fn test_stories_for_stage_out_of_range() {
        let (runner, _, _) = runner_with(vec![]).await;
        let err = runner.stories_for_stage(2, None).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Programming);
    }

    #[tokio::test]
    async fn test_dispatch_strips_identity_and_leaves_pointer() {
        let (runner, store, sink) = runner_with(vec![json!({ "stories_id": 1, "x": 1 })]).await;

        let mut stories = runner.stories_for_stage(0, None).await.unwrap();
        let story = stories.remove(0);
        assert!(story.contains_key("_id"));
        runner.dispatch(story, 0).await.unwrap();

        let tasks = sink.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].stage_index, 0);
        assert_eq!(tasks[0].stage_name, "A");
        assert_eq!(
            Value::Object(tasks[0].story.clone()),
            json!({ "stories_id": 1, "x": 1, "_pipeline": { "next_stage": 0 } })
        );

        // Still eligible until the executor advances it
        assert_eq!(
            store
                .count(&Filter::eq("_pipeline.next_stage", json!(0)))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_dispatch_snapshot_is_independent() {
        let (runner, _, sink) = runner_with(vec![json!({ "x": 1 })]).await;

        let story = runner.stories_for_stage(0, None).await.unwrap().remove(0);
        let id = story["_id"].as_str().unwrap().to_string();
        let mut original = story.clone();
        runner.dispatch(story, 0).await.unwrap();
        original.insert("x".into(), json!(99));

        let tasks = sink.tasks.lock().unwrap().clone();
        assert_eq!(tasks[0].origin_id.as_deref(), Some(id.as_str()));
        assert_eq!(
            Value::Object(tasks[0].story.clone()),
            json!({ "x": 1, "_pipeline": { "next_stage": 0 } })
        );
    }

    #[tokio::test]
    async fn test_run_redispatches_until_advanced() {
        let (runner, _, sink) = runner_with(vec![json!({ "stories_id": 1 })]).await;

        runner.run(None).await.unwrap();
        runner.run(None).await.unwrap();

        // No in-flight marker: the same story/stage pair goes out twice
        let tasks = sink.tasks.lock().unwrap().clone();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.stage_index == 0));
    }

    #[tokio::test]
    async fn test_run_respects_limit() {
        let stories = (0..5).map(|i| json!({ "stories_id": i })).collect();
        let (runner, _, sink) = runner_with(stories).await;

        let report = runner.run(Some(2)).await.unwrap();

        assert_eq!(report.stages[0].dispatched, 2);
        assert_eq!(report.stages[1].dispatched, 0);
        let ids: Vec<Value> = sink
            .tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.story["stories_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(0), json!(1)]);
    }
}
