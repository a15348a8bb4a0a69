//! Block store engine
//!
//! Implements `write(type, data) -> score` and `read(score, n) -> data`
//! over the tier chain described in the crate docs.
//!
//! Write dedup checks run cheapest first: shared-cache existence marker,
//! local index, then the durable store (backend `exists` for the direct
//! layout; open chunk and chunk refs for the batched layout). The first hit
//! short-circuits the write and backfills the faster tiers.
//!
//! Reads take the first hit among local index, shared cache, open chunk and
//! durable store, backfilling the tiers in front of the one that answered.
//! Data fetched over the network is checked against its score before it is
//! trusted.

use crate::backend::{self, BackendError, DurableBackend};
use crate::batcher::ChunkBatcher;
use crate::cache::{self, SharedCache, marker_key};
use crate::index::LocalIndex;
use bytes::Bytes;
use s3venti_common::config::{BatchConfig, Config, WriteStrategy};
use s3venti_common::{Block, BlockType, Chunk, ContentAddresser, Error, Result, Score};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Identity returned by the handshake; there is no authentication
pub const ANONYMOUS: &str = "anonymous";

/// Request and tier-hit counters
#[derive(Debug, Default)]
pub struct StoreStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    /// Writes short-circuited because the content was already stored
    pub dedup_hits: AtomicU64,
    pub index_hits: AtomicU64,
    pub shared_hits: AtomicU64,
    pub chunk_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    /// Direct-layout puts issued to the durable backend
    pub durable_puts: AtomicU64,
    pub not_found: AtomicU64,
}

impl StoreStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        write!(
            f,
            "reads={} writes={} dedup={} hits(index={} shared={} chunk={} durable={}) puts={} not_found={}",
            get(&self.reads),
            get(&self.writes),
            get(&self.dedup_hits),
            get(&self.index_hits),
            get(&self.shared_hits),
            get(&self.chunk_hits),
            get(&self.durable_hits),
            get(&self.durable_puts),
            get(&self.not_found),
        )
    }
}

/// Content-addressed block store over local, shared and durable tiers
pub struct BlockStore {
    addresser: ContentAddresser,
    index: Arc<LocalIndex>,
    shared: Arc<dyn SharedCache>,
    backend: Arc<dyn DurableBackend>,
    /// Present only for the batched write strategy
    batcher: Option<ChunkBatcher>,
    stats: StoreStats,
}

impl BlockStore {
    /// Assemble an engine from its tiers. With the batched strategy this
    /// spawns the chunk batcher, so it must run inside a Tokio runtime.
    pub fn new(
        index: Arc<LocalIndex>,
        shared: Arc<dyn SharedCache>,
        backend: Arc<dyn DurableBackend>,
        batching: &BatchConfig,
    ) -> Self {
        let batcher = match batching.strategy {
            WriteStrategy::Direct => None,
            WriteStrategy::Batched => Some(ChunkBatcher::spawn(
                batching,
                Arc::clone(&backend),
                Some(Arc::clone(&index)),
            )),
        };
        Self {
            addresser: ContentAddresser::default(),
            index,
            shared,
            backend,
            batcher,
            stats: StoreStats::default(),
        }
    }

    /// Open every configured tier. Failing to open the local index is fatal.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(LocalIndex::open(config.index.resolved_path())?);
        let shared = cache::build(&config.shared_cache);
        let backend = backend::build(&config.backend)?;
        let store = Self::new(index, shared, backend, &config.batching);
        info!("Block store ready ({:?} writes)", store.strategy());
        Ok(store)
    }

    /// Handshake; every client is anonymous
    pub fn hello(&self) -> &'static str {
        ANONYMOUS
    }

    pub fn strategy(&self) -> WriteStrategy {
        if self.batcher.is_some() {
            WriteStrategy::Batched
        } else {
            WriteStrategy::Direct
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Store `data` and return its score. Content already stored anywhere
    /// reachable is not written again.
    pub async fn write(&self, block_type: BlockType, data: Bytes) -> Result<Score> {
        StoreStats::bump(&self.stats.writes);
        let score = self.addresser.score(&data);

        if self.is_stored(&score, &data).await? {
            StoreStats::bump(&self.stats.dedup_hits);
            debug!("Write of {score} deduplicated");
            return Ok(score);
        }

        match &self.batcher {
            None => {
                self.backend.put(&score.to_hex(), data.clone()).await?;
                StoreStats::bump(&self.stats.durable_puts);
            }
            Some(batcher) => {
                batcher
                    .offer(Block::new(block_type, score, data.clone()))
                    .await?;
            }
        }

        self.index.set(&score, &data)?;
        self.backfill_shared(&score, data).await;
        debug!("Stored {score} (type {block_type})");
        Ok(score)
    }

    /// Read up to `max_bytes` of the block stored under `score`
    pub async fn read(&self, score: &Score, max_bytes: usize) -> Result<Bytes> {
        StoreStats::bump(&self.stats.reads);
        let mut data = self.fetch(score).await?;
        data.truncate(max_bytes);
        Ok(data)
    }

    /// Push any batched blocks to the durable store now
    pub async fn sync(&self) -> Result<()> {
        if let Some(batcher) = &self.batcher {
            batcher.flush().await?;
        }
        Ok(())
    }

    /// Flush and stop the batcher. The engine serves reads afterwards but
    /// batched writes fail.
    pub async fn close(&self) -> Result<()> {
        if let Some(batcher) = &self.batcher {
            batcher.shutdown().await?;
        }
        info!("Block store closed: {}", self.stats);
        Ok(())
    }

    /// Dedup check; backfills faster tiers on a hit
    async fn is_stored(&self, score: &Score, data: &Bytes) -> Result<bool> {
        if self.shared.get(&marker_key(score)).await.is_some() {
            if !self.index.contains(score)? {
                self.index.set(score, data)?;
            }
            return Ok(true);
        }

        if self.index.contains(score)? {
            self.shared.set(&marker_key(score), Bytes::new()).await;
            return Ok(true);
        }

        let durable = match &self.batcher {
            None => self.backend.exists(&score.to_hex()).await?,
            Some(batcher) => {
                Self::open_chunk_lookup(batcher, score).await?.is_some()
                    || self.index.chunk_for(score)?.is_some()
            }
        };
        if durable {
            self.index.set(score, data)?;
            self.backfill_shared(score, data.clone()).await;
        }
        Ok(durable)
    }

    async fn fetch(&self, score: &Score) -> Result<Bytes> {
        if let Some(data) = self.index.get(score)? {
            StoreStats::bump(&self.stats.index_hits);
            debug!("{score}: local index hit");
            return Ok(Bytes::from(data));
        }

        if let Some(data) = self.shared.get(&score.to_hex()).await {
            if self.addresser.score(&data) == *score {
                StoreStats::bump(&self.stats.shared_hits);
                debug!("{score}: shared cache hit");
                self.index.set(score, &data)?;
                return Ok(data);
            }
            warn!("{score}: shared cache returned mismatched data, ignoring");
        }

        if let Some(batcher) = &self.batcher {
            if let Some(block) = Self::open_chunk_lookup(batcher, score).await? {
                StoreStats::bump(&self.stats.chunk_hits);
                debug!("{score}: open chunk hit");
                self.index.set(score, &block.data)?;
                return Ok(block.data);
            }
        }

        let data = match self.fetch_durable(score).await {
            Ok(data) => data,
            Err(e) => {
                if e.is_not_found() {
                    StoreStats::bump(&self.stats.not_found);
                }
                return Err(e);
            }
        };
        if self.addresser.score(&data) != *score {
            return Err(Error::encoding(format!(
                "durable data for {score} does not match its score"
            )));
        }

        StoreStats::bump(&self.stats.durable_hits);
        debug!("{score}: durable hit");
        self.index.set(score, &data)?;
        self.backfill_shared(score, data.clone()).await;
        Ok(data)
    }

    /// Look in the open chunk. A shut-down batcher has already flushed and
    /// recorded its chunk refs, so it reads as an empty chunk.
    async fn open_chunk_lookup(batcher: &ChunkBatcher, score: &Score) -> Result<Option<Block>> {
        match batcher.lookup(*score).await {
            Err(Error::Shutdown) => Ok(None),
            other => other,
        }
    }

    /// Fetch from the durable store using the layout of the write strategy
    async fn fetch_durable(&self, score: &Score) -> Result<Bytes> {
        let not_found = |e: BackendError| match e {
            BackendError::NotFound(_) => Error::NotFound { score: *score },
            other => other.into(),
        };

        if self.batcher.is_none() {
            return self.backend.get(&score.to_hex()).await.map_err(not_found);
        }

        let Some(chunk_id) = self.index.chunk_for(score)? else {
            return Err(Error::NotFound { score: *score });
        };
        let bytes = self.backend.get(chunk_id.as_str()).await.map_err(|e| {
            if e.is_not_found() {
                warn!("{score}: chunk {chunk_id} is referenced but missing");
            }
            not_found(e)
        })?;
        let mut chunk = Chunk::decode(&bytes)?;
        chunk
            .blocks
            .remove(&score.to_hex())
            .map(|block| block.data)
            .ok_or_else(|| Error::encoding(format!("chunk {chunk_id} does not hold {score}")))
    }

    async fn backfill_shared(&self, score: &Score, data: Bytes) {
        self.shared.set(&score.to_hex(), data).await;
        self.shared.set(&marker_key(score), Bytes::new()).await;
    }
}
