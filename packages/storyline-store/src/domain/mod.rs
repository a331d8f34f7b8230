//! Domain layer for StoryStore
//!
//! # Domain Models
//!
//! - `Document`: an open-ended JSON object, one story
//! - `Filter`: selection predicate over dotted field paths
//! - `Update`: ordered top-level `$set` of fields
//!
//! # Port Trait
//!
//! - `StoryStore`: primary storage abstraction, implemented by the memory and
//!   SQLite adapters in `infrastructure`
//!
//! # Examples
//!
//! ```rust,ignore
//! use storyline_store::{Filter, StoryStore, Update};
//! use serde_json::json;
//!
//! async fn example(store: &dyn StoryStore) -> storyline_store::Result<()> {
//!     // Initialize every story that has no pipeline metadata yet
//!     store
//!         .update_many(
//!             &Filter::missing("_pipeline"),
//!             &Update::set("_pipeline", json!({ "next_stage": 0 })),
//!         )
//!         .await?;
//!
//!     // Stories waiting for stage 0
//!     let ready = store
//!         .find(&Filter::eq("_pipeline.next_stage", json!(0)), Some(10))
//!         .await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{Result, StorageError};

/// Store-internal identity field. Assigned on insert, returned by `find`,
/// never portable outside the store.
pub const ID_KEY: &str = "_id";

/// One story: a mapping from field name to value
pub type Document = Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════
// Field Paths
// ═══════════════════════════════════════════════════════════════════════════

/// Check that a dotted field path is usable by every adapter.
///
/// Segments must be non-empty and made of ASCII alphanumerics or `_`.
pub fn validate_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_path(path))
    }
}

/// Resolve a dotted path (`_pipeline.next_stage`) inside a document
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Identity of a stored document, if it carries one
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_KEY).and_then(Value::as_str)
}

// ═══════════════════════════════════════════════════════════════════════════
// Filter
// ═══════════════════════════════════════════════════════════════════════════

/// Selection predicate used by `find`, `update_many` and `count`
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document
    All,
    /// Field path is absent
    Missing(String),
    /// Field path is present and equal to the value
    Eq(String, Value),
    /// Every inner filter matches
    And(Vec<Filter>),
}

impl Filter {
    pub fn missing(path: impl Into<String>) -> Self {
        Filter::Missing(path.into())
    }

    pub fn eq(path: impl Into<String>, value: Value) -> Self {
        Filter::Eq(path.into(), value)
    }

    /// Combine with another filter (flattens nested `And`)
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            Filter::All => other,
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Missing(path) => lookup(doc, path).is_none(),
            Filter::Eq(path, value) => lookup(doc, path) == Some(value),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }

    /// Validate every field path the filter references
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::All => Ok(()),
            Filter::Missing(path) | Filter::Eq(path, _) => validate_path(path),
            Filter::And(filters) => filters.iter().try_for_each(Filter::validate),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Update
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered `$set` of top-level fields.
///
/// Later assignments to the same field win. The identity field is never
/// written through an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
}

impl Update {
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        Self::default().and_set(field, value)
    }

    /// Set every field of a partial document
    pub fn merge(partial: &Document) -> Self {
        partial
            .iter()
            .fold(Self::default(), |update, (k, v)| update.and_set(k.clone(), v.clone()))
    }

    pub fn and_set(mut self, field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        if field != ID_KEY {
            self.set.push((field, value));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.set.iter().map(|(k, _)| k.as_str())
    }

    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            doc.insert(field.clone(), value.clone());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Story store abstraction
///
/// Every operation is independently safe to call concurrently: there is no
/// check-then-act across calls. `update_many` is atomic per call.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Insert stories, assigning `_id` (UUID v4) to those without one.
    ///
    /// # Returns
    ///
    /// Identities of the inserted stories, in input order
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if:
    /// - `_id` is present but not a string
    /// - `_id` already exists in the store
    async fn insert_many(&self, stories: Vec<Document>) -> Result<Vec<String>>;

    /// Find stories matching the filter, in arrival order
    ///
    /// # Arguments
    ///
    /// - `filter`: Selection predicate
    /// - `limit`: Maximum number of stories to return (None = unlimited)
    async fn find(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Document>>;

    /// Apply an update to every matching story
    ///
    /// # Returns
    ///
    /// Number of stories updated
    async fn update_many(&self, filter: &Filter, update: &Update) -> Result<u64>;

    /// Create an index on a field path (idempotent, advisory)
    async fn create_index(&self, field: &str) -> Result<()>;

    /// Count matching stories
    async fn count(&self, filter: &Filter) -> Result<u64>;
}
