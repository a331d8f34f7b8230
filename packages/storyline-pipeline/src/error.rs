use storyline_store::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Stage {stage} failed: {message}")]
    StageExecutionFailed { stage: String, message: String },

    #[error("{driver} does not support {operation}")]
    Unsupported {
        driver: &'static str,
        operation: &'static str,
    },

    #[error("Stage index {index} out of range (stage count {stage_count})")]
    StageIndexOutOfRange { index: usize, stage_count: usize },

    #[error("Stage {index} is {expected} here but the task names {found}")]
    SequenceMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Invalid story: {0}")]
    InvalidStory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn invalid_story<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidStory(e.to_string())
    }

    pub fn dispatch<E: std::fmt::Display>(e: E) -> Self {
        Self::Dispatch(e.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Storage(_) => ErrorCategory::Store,
            PipelineError::StageNotFound(_) => ErrorCategory::Resolution,
            PipelineError::StageExecutionFailed { .. } => ErrorCategory::StageExecution,
            PipelineError::Unsupported { .. }
            | PipelineError::StageIndexOutOfRange { .. }
            | PipelineError::SequenceMismatch { .. } => ErrorCategory::Programming,
            PipelineError::Dispatch(_) => ErrorCategory::Dispatch,
            PipelineError::InvalidStory(_) | PipelineError::Serialization(_) => {
                ErrorCategory::Data
            }
            PipelineError::Io(_) => ErrorCategory::Io,
            PipelineError::Config(_) => ErrorCategory::Config,
            PipelineError::Other(_) => ErrorCategory::StageExecution,
        }
    }
}

/// Error category, used by whatever schedules `run` to decide what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Stage name does not map to a registered stage (misconfiguration)
    Resolution,
    /// A stage's `process` call failed
    StageExecution,
    /// Store query or update failed - retry the whole `run` later
    Store,
    /// Task could not be handed to the executor
    Dispatch,
    /// Driver used in a way it does not support
    Programming,
    /// Story or pipeline metadata is malformed
    Data,
    /// Story source could not be read or written
    Io,
    /// Configuration is invalid
    Config,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::StageExecution => "stage_execution",
            ErrorCategory::Store => "store",
            ErrorCategory::Dispatch => "dispatch",
            ErrorCategory::Programming => "programming",
            ErrorCategory::Data => "data",
            ErrorCategory::Io => "io",
            ErrorCategory::Config => "config",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "resolution" => Ok(ErrorCategory::Resolution),
            "stage_execution" => Ok(ErrorCategory::StageExecution),
            "store" => Ok(ErrorCategory::Store),
            "dispatch" => Ok(ErrorCategory::Dispatch),
            "programming" => Ok(ErrorCategory::Programming),
            "data" => Ok(ErrorCategory::Data),
            "io" => Ok(ErrorCategory::Io),
            "config" => Ok(ErrorCategory::Config),
            _ => Err(PipelineError::invalid_story(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    /// Worth retrying the same call later without changing anything
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Store | ErrorCategory::Dispatch | ErrorCategory::Io
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
