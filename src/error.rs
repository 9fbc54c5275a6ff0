#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

use crate::task::model::TaskStatus;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("task {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to launch agent: {0}")]
    Spawn(String),

    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("{0}")]
    Other(String),
}

impl QueueError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}
