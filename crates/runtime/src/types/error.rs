//! Error types for the sandbox runtime

use std::time::Duration;
use thiserror::Error;

/// Archive encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Archive path '{path}' is {len} bytes, limit is 100")]
    NameTooLong { path: String, len: usize },

    #[error("Archive entry '{path}' is {size} bytes, exceeds the octal size field")]
    ContentTooLarge { path: String, size: u64 },

    #[error("Invalid archive path '{0}': must be relative and forward-slash separated")]
    InvalidPath(String),

    #[error("Duplicate archive path: {0}")]
    DuplicatePath(String),

    #[error("Modification time {0} does not fit the octal mtime field")]
    InvalidMtime(u64),
}

/// Errors reported by an execution engine backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Execution engine unreachable: {0}")]
    Unreachable(String),

    #[error("Engine object not found: {0}")]
    NotFound(String),

    #[error("Engine object already exists: {0}")]
    Conflict(String),

    #[error("Engine operation '{operation}' failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
}

impl EngineError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Request {
            operation,
            message: message.into(),
        }
    }
}

/// Sandbox lifecycle and command execution errors
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Execution engine not reachable after {waited:?}: {reason}")]
    Connectivity { waited: Duration, reason: String },

    #[error("Sandbox provisioning failed for '{name}': {reason}")]
    Provisioning { name: String, reason: String },

    #[error("File injection into '{name}' failed: {reason}")]
    Injection { name: String, reason: String },

    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Engine call '{operation}' did not complete within {limit:?}")]
    EngineTimeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("Sandbox pool is closed")]
    PoolClosed,

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl SandboxError {
    /// Classify an engine error raised while provisioning `name`
    pub fn provisioning(name: &str, error: EngineError) -> Self {
        match error {
            EngineError::Unreachable(reason) => Self::Connectivity {
                waited: Duration::ZERO,
                reason,
            },
            other => Self::Provisioning {
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

impl From<EngineError> for SandboxError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Unreachable(reason) => Self::Connectivity {
                waited: Duration::ZERO,
                reason,
            },
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

/// Submission rejected before any engine contact
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Source code is empty")]
    EmptySource,

    #[error("Source code is {actual} characters, limit is {limit}")]
    TooLarge { actual: usize, limit: usize },
}
