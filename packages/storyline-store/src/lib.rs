//! StoryStore - shared document store for pipeline stories
//!
//! ## Core Principles
//!
//! 1. **Arrival order**: `find` yields stories in insertion order
//! 2. **Opaque identity**: `_id` is assigned by the store and is not portable
//! 3. **Independent operations**: every call is atomic on its own, nothing is
//!    held between calls
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storyline_store::{Filter, MemoryStoryStore, StoryStore, Update};
//! use serde_json::json;
//!
//! let store = MemoryStoryStore::new();
//! store.insert_many(vec![story]).await?;
//! store.create_index("_pipeline.next_stage").await?;
//!
//! let ready = store
//!     .find(&Filter::eq("_pipeline.next_stage", json!(0)), None)
//!     .await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{document_id, lookup, validate_path, Document, Filter, StoryStore, Update, ID_KEY};
pub use infrastructure::MemoryStoryStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStoryStore;
