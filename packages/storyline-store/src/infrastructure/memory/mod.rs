//! In-process StoryStore
//!
//! Keeps stories in arrival order behind a `parking_lot::RwLock`. Used by
//! tests and by single-process deployments that do not need durability.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{document_id, validate_path, Document, Filter, StoryStore, Update, ID_KEY};
use crate::{Result, StorageError};

#[derive(Default)]
pub struct MemoryStoryStore {
    stories: RwLock<Vec<Document>>,
    indexes: Mutex<BTreeSet<String>>,
}

impl MemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexed field paths (advisory only, nothing is accelerated)
    pub fn indexes(&self) -> Vec<String> {
        self.indexes.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.read().is_empty()
    }
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn insert_many(&self, stories: Vec<Document>) -> Result<Vec<String>> {
        let mut guard = self.stories.write();
        let mut seen: HashSet<String> = guard
            .iter()
            .filter_map(|s| document_id(s).map(str::to_string))
            .collect();

        // Validate the whole batch before touching the store
        let mut prepared = Vec::with_capacity(stories.len());
        for mut story in stories {
            let id = match story.get(ID_KEY) {
                None => Uuid::new_v4().to_string(),
                Some(Value::String(id)) => id.clone(),
                Some(other) => {
                    return Err(StorageError::invalid_document(format!(
                        "Identity must be a string, got {}",
                        other
                    )))
                }
            };
            if !seen.insert(id.clone()) {
                return Err(StorageError::invalid_document(format!(
                    "Duplicate identity: {}",
                    id
                )));
            }
            story.insert(ID_KEY.to_string(), Value::String(id.clone()));
            prepared.push((id, story));
        }

        let mut ids = Vec::with_capacity(prepared.len());
        for (id, story) in prepared {
            guard.push(story);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>> {
        filter.validate()?;
        let guard = self.stories.read();
        Ok(guard
            .iter()
            .filter(|s| filter.matches(s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64> {
        filter.validate()?;

        let mut guard = self.stories.write();
        let mut updated = 0;
        for story in guard.iter_mut().filter(|s| filter.matches(s)) {
            update.apply(story);
            updated += 1;
        }
        Ok(updated)
    }

    async fn create_index(&self, field: &str) -> Result<()> {
        validate_path(field)?;
        self.indexes.lock().insert(field.to_string());
        Ok(())
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        filter.validate()?;
        let guard = self.stories.read();
        Ok(guard.iter().filter(|s| filter.matches(s)).count() as u64)
    }
}
