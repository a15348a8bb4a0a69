//! s3venti Block Store
//!
//! This crate implements the content-addressed block store engine. Reads
//! and writes walk a fixed chain of tiers, fastest first:
//!
//! ```text
//! ┌──────────────────┐
//! │   BlockStore     │  read(score, n) / write(type, data)
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │   LocalIndex     │  redb: score → data, score → chunk id
//! └────────┬─────────┘
//! ┌────────▼─────────┐
//! │   SharedCache    │  memcached: score → data, existence markers
//! └────────┬─────────┘
//! ┌────────▼─────────┐
//! │   ChunkBatcher   │  open chunk (batched strategy only)
//! └────────┬─────────┘
//! ┌────────▼─────────┐
//! │ DurableBackend   │  S3: one object per score, or per chunk
//! └──────────────────┘
//! ```

pub mod backend;
pub mod batcher;
pub mod cache;
pub mod engine;
pub mod index;
pub mod maintenance;

pub use backend::{BackendError, BackendResult, DurableBackend, MemoryBackend, S3Backend};
pub use batcher::{BatcherStats, ChunkBatcher};
pub use cache::{MemcachedCache, MemoryCache, NoopCache, SharedCache, marker_key};
pub use engine::{ANONYMOUS, BlockStore, StoreStats};
pub use index::{IndexError, IndexResult, LocalIndex};
