//! Core types shared by the sandbox runtime

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Default ceiling on submitted source length, in characters
pub const DEFAULT_MAX_SOURCE_CHARS: usize = 200_000;

/// Unique identifier for one submission passing through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Untrusted source text together with the ceiling it must respect
#[derive(Debug, Clone)]
pub struct SourceSubmission {
    pub code: String,
    pub size_limit: usize,
}

impl SourceSubmission {
    pub fn new(code: impl Into<String>, size_limit: usize) -> Self {
        Self {
            code: code.into(),
            size_limit,
        }
    }

    /// Reject blank or oversized source. Length is counted in characters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }

        let actual = self.code.chars().count();
        if actual > self.size_limit {
            return Err(ValidationError::TooLarge {
                actual,
                limit: self.size_limit,
            });
        }

        Ok(())
    }
}

/// A file to place into a sandbox working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: Bytes,
    pub mode: u32,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: 0o644,
        }
    }
}
