//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process store (always available)
//! - `sqlite`: SQLite adapter (feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStoryStore;
