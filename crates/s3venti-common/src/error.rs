//! Error types for s3venti
//!
//! This module defines the common error types used throughout the system.

use crate::score::{Score, ScoreError};
use thiserror::Error;

/// Common result type for s3venti operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for s3venti
#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("block not found: {score}")]
    NotFound { score: Score },

    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    // Tier errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("local index error: {0}")]
    LocalIndex(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid score: {0}")]
    InvalidScore(#[from] ScoreError),

    // Process errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("chunk batcher is shut down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a local index error
    pub fn local_index(msg: impl Into<String>) -> Self {
        Self::LocalIndex(msg.into())
    }

    /// Create an encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ObjectNotFound { .. })
    }

    /// Check if the client may reasonably retry the request
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}
