//! Error types for the agent runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Task engine errors surfaced to the caller of an engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Task {id} already exists")]
    DuplicateTask { id: String },

    #[error("Invalid task definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Checkpoint store errors. These always propagate: a half-written or
/// half-restored checkpoint is unsafe to rely on.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Invalid checkpoint argument: {0}")]
    InvalidArgument(String),

    #[error("Checkpoint not found: {id}")]
    NotFound { id: String },

    #[error("Checkpoint store returned an empty id for task {task_id}")]
    EmptyId { task_id: String },

    #[error("No checkpoint store configured")]
    Unavailable,

    #[error("Invalid checkpoint state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Connection manager errors. Only used for sweep bookkeeping; the public
/// connection API reports outcomes as booleans.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection not found: {session_id}")]
    NotFound { session_id: String },
}

/// Classification of an execution failure, used by retry allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or a programming error. Never retried.
    Validation,
    /// I/O failure.
    Io,
    /// Transient runtime failure.
    Runtime,
    /// Anything else.
    Other,
    /// Deadline exceeded.
    Timeout,
    /// Cancelled before completion.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Io => "io",
            Self::Runtime => "runtime",
            Self::Other => "other",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Error returned by a task executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn runtime(reason: impl Into<String>) -> Self {
        Self::Runtime(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Io,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Validation-class errors fail fast and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Recoverable errors count toward the retry budget.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Runtime(_) | Self::Other(_))
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
