//! Pipeline configuration (YAML)
//!
//! ```yaml
//! version: 1
//! stages: [Tokenize, Geocode]
//! mode: queued
//! limit: 500
//! store:
//!   path: stories.db
//! workers: 4
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storyline_store::{MemoryStoryStore, StoryStore};
use thiserror::Error;

use crate::driver::StageSequence;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Semantically invalid value
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Queued,
    Inline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database file; in-memory store when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_workers() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub version: u32,

    pub stages: Vec<String>,

    #[serde(default)]
    pub mode: RunMode,

    /// Per-stage discovery cap passed to `run`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl PipelineConfig {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: CONFIG_VERSION,
            stages: stages.into_iter().map(Into::into).collect(),
            mode: RunMode::default(),
            limit: None,
            store: StoreConfig::default(),
            workers: default_workers(),
        }
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: vec![CONFIG_VERSION],
            });
        }
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("at least one stage is required".into()));
        }

        let mut seen = HashSet::new();
        for name in &self.stages {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage names must not be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!("stage '{}' listed twice", name)));
            }
        }

        if self.limit == Some(0) {
            return Err(ConfigError::Invalid("limit must be greater than 0".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn stage_sequence(&self) -> StageSequence {
        StageSequence::from_names(self.stages.iter().cloned())
    }

    /// Open the configured store (SQLite file, or in-memory)
    pub fn open_store(&self) -> crate::error::Result<Arc<dyn StoryStore>> {
        match &self.store.path {
            #[cfg(feature = "sqlite")]
            Some(path) => Ok(Arc::new(storyline_store::SqliteStoryStore::open(path)?)),
            #[cfg(not(feature = "sqlite"))]
            Some(path) => Err(ConfigError::Invalid(format!(
                "store path {} needs the sqlite feature",
                path.display()
            ))
            .into()),
            None => Ok(Arc::new(MemoryStoryStore::new())),
        }
    }
}
