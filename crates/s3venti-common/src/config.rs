//! Configuration types for s3venti
//!
//! One [`Config`] is loaded at startup (TOML file, then command-line
//! overrides) and handed by reference to every component constructor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for s3venti
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Venti listener configuration
    pub server: ServerConfig,
    /// Durable object store configuration
    pub backend: BackendConfig,
    /// Shared cache configuration
    pub shared_cache: SharedCacheConfig,
    /// Local index configuration
    pub index: IndexConfig,
    /// Write strategy and chunk batching thresholds
    pub batching: BatchConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.backend.kind == BackendKind::S3 && self.backend.bucket.is_empty() {
            return Err(Error::Configuration("backend.bucket must be set".into()));
        }
        let b = &self.batching;
        if b.max_blocks == 0 || b.max_bytes == 0 || b.max_age_ms == 0 || b.queue_depth == 0 {
            return Err(Error::Configuration(
                "batching thresholds must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Venti protocol listener
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:17034".to_string(),
        }
    }
}

/// Which durable store implementation to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// S3-compatible object store
    #[default]
    S3,
    /// Process-local map (testing and development only, not durable)
    Memory,
}

/// Durable object store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Bucket holding all blocks or chunks
    pub bucket: String,
    /// Service endpoint, path-style addressing is used
    pub endpoint: String,
    /// Signing region
    pub region: String,
    /// Access key; falls back to `AWS_ACCESS_KEY_ID`
    pub access_key: Option<String>,
    /// Secret key; falls back to `AWS_SECRET_ACCESS_KEY`
    pub secret_key: Option<String>,
    /// Per-request timeout in milliseconds (0 = none)
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::S3,
            bucket: "s3venti".to_string(),
            endpoint: "https://s3.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            timeout_ms: 0,
        }
    }
}

/// Shared cache configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    /// memcached `host:port`; the tier is disabled when unset
    pub address: Option<String>,
}

/// Local index configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Database file; defaults to `~/.s3venti/scores.db`
    pub path: Option<PathBuf>,
}

impl IndexConfig {
    /// Resolve the database path, applying the per-user default
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_index_path)
    }
}

fn default_index_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".s3venti").join("scores.db")
}

/// How novel blocks reach the durable store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// One synchronous put per block, keyed by score
    #[default]
    Direct,
    /// Blocks accumulate into chunks flushed as single objects
    Batched,
}

/// Write strategy and chunk batching thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub strategy: WriteStrategy,
    /// Flush once the open chunk holds this many blocks
    pub max_blocks: usize,
    /// Flush once the open chunk holds this many data bytes
    pub max_bytes: usize,
    /// Flush a non-empty chunk this long after it opened (milliseconds)
    pub max_age_ms: u64,
    /// Capacity of the batcher's command queue
    pub queue_depth: usize,
}

impl BatchConfig {
    /// Idle window as a duration
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategy: WriteStrategy::Direct,
            max_blocks: 1024,
            max_bytes: 8 * 1024 * 1024, // 8 MB
            max_age_ms: 30_000,
            queue_depth: 256,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive
    pub level: String,
    /// Debug verbosity: 1 = debug, 2 or more = trace
    pub debug: u8,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl LoggingConfig {
    /// Filter directive after applying the debug verbosity
    #[must_use]
    pub fn effective_level(&self) -> &str {
        match self.debug {
            0 => &self.level,
            1 => "debug",
            _ => "trace",
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: 0,
            json: false,
        }
    }
}
