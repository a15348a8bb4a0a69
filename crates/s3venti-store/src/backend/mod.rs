//! Durable backend abstraction
//!
//! The durable tier is a slow, remote key → bytes blob store. Every call may
//! cross the network, so implementations must keep "the key is absent"
//! ([`BackendError::NotFound`]) distinct from "the call failed"
//! ([`BackendError::Transport`]).
//!
//! # Backends
//!
//! - `s3`: S3-compatible object store over HTTP with SigV4 signing
//! - `memory`: process-local map, for tests and development

pub mod memory;
pub mod s3;
pub mod sigv4;

pub use memory::MemoryBackend;
pub use s3::S3Backend;

use async_trait::async_trait;
use bytes::Bytes;
use s3venti_common::Error;
use s3venti_common::config::{BackendConfig, BackendKind};
use std::sync::Arc;
use tracing::info;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Durable backend failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The key does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// The request did not complete (connection, timeout, remote error)
    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::NotFound(key) => Error::ObjectNotFound { key },
            BackendError::Transport(msg) => Error::Transport(msg),
        }
    }
}

/// Remote, durable, key-addressed blob store
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Check whether `key` exists
    async fn exists(&self, key: &str) -> BackendResult<bool>;

    /// Fetch the object stored under `key`
    async fn get(&self, key: &str) -> BackendResult<Bytes>;

    /// Store `data` under `key`. Re-putting identical content is harmless.
    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()>;

    /// Enumerate every key starting with `prefix`.
    ///
    /// Only used by maintenance tooling, never on the request path.
    async fn list_all(&self, prefix: &str) -> BackendResult<Vec<String>>;
}

/// Build the configured durable backend
pub fn build(config: &BackendConfig) -> s3venti_common::Result<Arc<dyn DurableBackend>> {
    let backend: Arc<dyn DurableBackend> = match config.kind {
        BackendKind::S3 => Arc::new(S3Backend::new(config)?),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    info!("Durable backend: {} (bucket {})", backend.name(), config.bucket);
    Ok(backend)
}
