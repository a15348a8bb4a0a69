//! Core type definitions for s3venti
//!
//! Blocks are the unit of storage; chunks are the unit of batched durable
//! writes.

use crate::error::{Error, Result};
use crate::score::Score;
use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque caller-supplied block tag. Stored verbatim, never hashed.
pub type BlockType = u8;

/// An immutable `(type, score, data)` triple
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_type: BlockType,
    pub score: Score,
    pub data: Bytes,
}

impl Block {
    /// Create a block from an already computed score
    #[must_use]
    pub fn new(block_type: BlockType, score: Score, data: Bytes) -> Self {
        Self {
            block_type,
            score,
            data,
        }
    }

    /// Size of the block's data in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block carries no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("block_type", &self.block_type)
            .field("score", &self.score)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Identifier of a chunk; also its durable object key
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct ChunkId(String);

impl ChunkId {
    /// Generate a fresh, unique chunk id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the chunk id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A batch of blocks persisted together as one durable object.
///
/// Blocks are keyed by the hex rendering of their score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub blocks: HashMap<String, Block>,
}

impl Chunk {
    /// Create an empty chunk with a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ChunkId::generate())
    }

    /// Create an empty chunk with the given id
    #[must_use]
    pub fn with_id(id: ChunkId) -> Self {
        Self {
            id,
            blocks: HashMap::new(),
        }
    }

    /// Add a block. Returns `false` if a block with the same score is
    /// already present, in which case the chunk is unchanged.
    pub fn insert(&mut self, block: Block) -> bool {
        let key = block.score.to_hex();
        if self.blocks.contains_key(&key) {
            return false;
        }
        self.blocks.insert(key, block);
        true
    }

    /// Look up a block by score
    #[must_use]
    pub fn get(&self, score: &Score) -> Option<&Block> {
        self.blocks.get(&score.to_hex())
    }

    /// Number of blocks in the chunk
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the chunk holds no blocks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total data bytes across all blocks
    #[must_use]
    pub fn data_bytes(&self) -> usize {
        self.blocks.values().map(Block::len).sum()
    }

    /// Scores of all blocks in the chunk
    pub fn scores(&self) -> impl Iterator<Item = Score> + '_ {
        self.blocks.values().map(|b| b.score)
    }

    /// Serialize for storage as one durable object
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a chunk read back from the durable store.
    ///
    /// Every block's key must match its score, otherwise the object is
    /// treated as corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let chunk: Self = bincode::deserialize(bytes)?;
        for (key, block) in &chunk.blocks {
            if *key != block.score.to_hex() {
                return Err(Error::encoding(format!(
                    "chunk {} maps key {key} to block {}",
                    chunk.id, block.score
                )));
            }
        }
        Ok(chunk)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}
