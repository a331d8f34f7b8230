//! Reserved story fields and pipeline metadata
//!
//! Every story carries its pipeline state under `_pipeline`, kept apart from
//! business fields:
//!
//! - queued mode: `{ "next_stage": <index> }`
//! - inline mode: `{ "status": "done" }`

use serde_json::{json, Value};
use storyline_store::Document;
use tracing::warn;

use crate::error::{PipelineError, Result};

pub use storyline_store::ID_KEY;

pub const METADATA_KEY: &str = "_pipeline";
pub const NEXT_STAGE_KEY: &str = "next_stage";
pub const STATUS_KEY: &str = "status";
pub const STATUS_DONE: &str = "done";

/// Portable story key, survives the trip to the executor (unlike `_id`)
pub const STORY_ID_KEY: &str = "stories_id";

/// Dotted path of the next stage index, as used in store filters and indexes
pub fn next_stage_path() -> String {
    format!("{}.{}", METADATA_KEY, NEXT_STAGE_KEY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMetadata {
    /// Index of the next stage the story must pass through
    Queued { next_stage: usize },
    /// Inline terminal marker
    Done,
}

impl PipelineMetadata {
    pub fn initial() -> Self {
        PipelineMetadata::Queued { next_stage: 0 }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PipelineMetadata::Queued { next_stage } => json!({ NEXT_STAGE_KEY: next_stage }),
            PipelineMetadata::Done => json!({ STATUS_KEY: STATUS_DONE }),
        }
    }

    /// Read the metadata of a story.
    ///
    /// Returns `None` when the story has no metadata or carries a shape that
    /// marks no progress (e.g. a status other than `done`).
    pub fn from_story(story: &Document) -> Result<Option<Self>> {
        let Some(meta) = story.get(METADATA_KEY) else {
            return Ok(None);
        };
        let meta = meta.as_object().ok_or_else(|| {
            PipelineError::invalid_story(format!("{} must be an object, got {}", METADATA_KEY, meta))
        })?;

        if let Some(next) = meta.get(NEXT_STAGE_KEY) {
            let next_stage = next.as_u64().ok_or_else(|| {
                PipelineError::invalid_story(format!(
                    "{} must be a non-negative integer, got {}",
                    NEXT_STAGE_KEY, next
                ))
            })?;
            return Ok(Some(PipelineMetadata::Queued {
                next_stage: next_stage as usize,
            }));
        }

        match meta.get(STATUS_KEY).and_then(Value::as_str) {
            Some(STATUS_DONE) => Ok(Some(PipelineMetadata::Done)),
            _ => Ok(None),
        }
    }

    /// Terminal for a pipeline of `stage_count` stages
    pub fn is_terminal(&self, stage_count: usize) -> bool {
        match self {
            PipelineMetadata::Queued { next_stage } => *next_stage >= stage_count,
            PipelineMetadata::Done => true,
        }
    }
}

/// Inline terminal marker check (`_pipeline.status == "done"`).
///
/// Malformed metadata is an error rather than "not done".
pub fn is_done(story: &Document) -> Result<bool> {
    Ok(PipelineMetadata::from_story(story)? == Some(PipelineMetadata::Done))
}

pub fn set_metadata(story: &mut Document, metadata: PipelineMetadata) {
    story.insert(METADATA_KEY.to_string(), metadata.to_value());
}

/// Drop reserved fields a stage must not write (`_pipeline`, `_id`)
pub fn strip_reserved(stage: &str, mut partial: Document) -> Document {
    for key in [METADATA_KEY, ID_KEY] {
        if partial.remove(key).is_some() {
            warn!("Stage {} returned reserved field {}, ignored", stage, key);
        }
    }
    partial
}

/// Merge a stage's partial update into a story (last write wins)
pub fn merge_update(story: &mut Document, stage: &str, partial: Document) {
    for (key, value) in strip_reserved(stage, partial) {
        story.insert(key, value);
    }
}
