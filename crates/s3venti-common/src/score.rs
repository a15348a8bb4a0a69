//! Content addressing
//!
//! A [`Score`] is the SHA-1 fingerprint of a block's data and is the only
//! key used to look blocks up in any tier. [`ContentAddresser`] computes
//! scores and keeps a small pool of hasher states for reuse.

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Size of a score in bytes
pub const SCORE_SIZE: usize = 20;

/// Default number of hasher states kept for reuse
pub const DEFAULT_HASHER_POOL: usize = 32;

/// Content fingerprint of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Score([u8; SCORE_SIZE]);

impl Score {
    /// Compute the score of `data` without touching any pool
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Wrap raw score bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SCORE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a score from a slice, which must be exactly [`SCORE_SIZE`] long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ScoreError> {
        let raw: [u8; SCORE_SIZE] = bytes
            .try_into()
            .map_err(|_| ScoreError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Raw score bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SCORE_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering, used as the durable object key
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Score({})", self.to_hex())
    }
}

impl FromStr for Score {
    type Err = ScoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ScoreError::InvalidHex(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Errors that can occur when parsing a score
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    #[error("score must be {SCORE_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    #[error("score is not valid hex: {0:?}")]
    InvalidHex(String),
}

/// Computes scores, recycling hasher states through a bounded pool.
///
/// Neither acquiring nor releasing a hasher ever blocks: an empty pool
/// yields a fresh hasher and a full pool drops the returned one.
pub struct ContentAddresser {
    pool_tx: Sender<Sha1>,
    pool_rx: Receiver<Sha1>,
}

impl ContentAddresser {
    /// Create an addresser whose pool retains up to `capacity` hashers
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (pool_tx, pool_rx) = bounded(capacity);
        Self { pool_tx, pool_rx }
    }

    /// Compute the score of `data`
    pub fn score(&self, data: &[u8]) -> Score {
        let mut hasher = self.pool_rx.try_recv().unwrap_or_else(|_| Sha1::new());
        hasher.update(data);
        let score = Score(hasher.finalize_reset().into());
        let _ = self.pool_tx.try_send(hasher);
        score
    }

    /// Number of hashers currently parked in the pool
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool_rx.len()
    }
}

impl Default for ContentAddresser {
    fn default() -> Self {
        Self::new(DEFAULT_HASHER_POOL)
    }
}
