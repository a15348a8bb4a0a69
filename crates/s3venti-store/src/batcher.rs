//! Chunk batcher
//!
//! A single task owns the open chunk. Every interaction (offering a block,
//! asking whether the open chunk holds a score, forcing a flush, shutting
//! down) is a message on its command queue, so the chunk itself needs no
//! lock. The idle timer competes with the queue in a `select!`; whichever
//! fires first is handled first.
//!
//! A chunk is flushed as one durable object keyed by its id when it reaches
//! the block or byte ceiling, when it has been open for the idle window, on
//! an explicit flush, or on shutdown. Empty chunks are never flushed. A
//! failed flush leaves the chunk open; its blocks go out with the next
//! successful flush.

use crate::backend::DurableBackend;
use crate::index::LocalIndex;
use bytes::Bytes;
use parking_lot::Mutex;
use s3venti_common::config::BatchConfig;
use s3venti_common::{Block, Chunk, ChunkId, Error, Result, Score};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Flush counters
#[derive(Debug, Default)]
pub struct BatcherStats {
    /// Blocks accepted into an open chunk
    pub blocks_offered: AtomicU64,
    /// Chunks persisted to the durable backend
    pub chunks_flushed: AtomicU64,
    /// Blocks persisted across all flushed chunks
    pub blocks_flushed: AtomicU64,
    /// Flush attempts the durable backend rejected
    pub flush_failures: AtomicU64,
}

impl BatcherStats {
    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed.load(Ordering::Relaxed)
    }

    pub fn blocks_flushed(&self) -> u64 {
        self.blocks_flushed.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }
}

enum Command {
    Offer(Block),
    Lookup {
        score: Score,
        reply: oneshot::Sender<Option<Block>>,
    },
    Flush {
        reply: oneshot::Sender<Result<Option<ChunkId>>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<Option<ChunkId>>>,
    },
}

/// Handle to the batching task
pub struct ChunkBatcher {
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<BatcherStats>,
}

impl ChunkBatcher {
    /// Start the batching task on the current runtime.
    ///
    /// When `index` is given, each flushed chunk's score → chunk id refs are
    /// recorded there.
    pub fn spawn(
        config: &BatchConfig,
        backend: Arc<dyn DurableBackend>,
        index: Option<Arc<LocalIndex>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let stats = Arc::new(BatcherStats::default());
        let task = BatchTask {
            chunk: Chunk::new(),
            opened_at: None,
            max_blocks: config.max_blocks.max(1),
            max_bytes: config.max_bytes.max(1),
            max_age: config.max_age(),
            backend,
            index,
            stats: Arc::clone(&stats),
        };
        info!(
            "Chunk batcher started: max_blocks={} max_bytes={} max_age={:?}",
            task.max_blocks, task.max_bytes, task.max_age
        );
        let handle = tokio::spawn(task.run(rx));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            stats,
        }
    }

    /// Hand a block to the open chunk. Waits only while the queue is full.
    pub async fn offer(&self, block: Block) -> Result<()> {
        self.tx
            .send(Command::Offer(block))
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Find `score` in the open chunk. Blocks already flushed are not seen.
    pub async fn lookup(&self, score: Score) -> Result<Option<Block>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Lookup { score, reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Flush the open chunk now. Returns the flushed chunk's id, or `None`
    /// if the chunk was empty.
    pub async fn flush(&self) -> Result<Option<ChunkId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush { reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Flush whatever is open and stop the task. Calling this again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<Option<ChunkId>> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_err() {
            return Ok(None);
        }
        let result = rx.await.map_err(|_| Error::Shutdown)?;

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Chunk batcher task failed: {e}");
            }
        }
        result
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }
}

/// State owned by the batching task
struct BatchTask {
    chunk: Chunk,
    /// When the first block entered the open chunk
    opened_at: Option<Instant>,
    max_blocks: usize,
    max_bytes: usize,
    max_age: Duration,
    backend: Arc<dyn DurableBackend>,
    index: Option<Arc<LocalIndex>>,
    stats: Arc<BatcherStats>,
}

impl BatchTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            // Only polled while the chunk holds blocks
            let deadline = self
                .opened_at
                .map_or_else(|| Instant::now() + self.max_age, |t| t + self.max_age);

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Offer(block)) => {
                        self.accept(block);
                        if self.is_full() {
                            let _ = self.rotate("size").await;
                        }
                    }
                    Some(Command::Lookup { score, reply }) => {
                        let _ = reply.send(self.chunk.get(&score).cloned());
                    }
                    Some(Command::Flush { reply }) => {
                        let _ = reply.send(self.rotate("forced").await);
                    }
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(self.rotate("shutdown").await);
                        break;
                    }
                    None => {
                        // Every handle dropped without a shutdown
                        let _ = self.rotate("shutdown").await;
                        break;
                    }
                },
                () = tokio::time::sleep_until(deadline), if !self.chunk.is_empty() => {
                    let _ = self.rotate("idle").await;
                }
            }
        }
        info!("Chunk batcher stopped");
    }

    fn accept(&mut self, block: Block) {
        let score = block.score;
        if self.chunk.insert(block) {
            if self.opened_at.is_none() {
                self.opened_at = Some(Instant::now());
            }
            self.stats.blocks_offered.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("Block {score} already in open chunk {}", self.chunk.id);
        }
    }

    fn is_full(&self) -> bool {
        self.chunk.len() >= self.max_blocks || self.chunk.data_bytes() >= self.max_bytes
    }

    /// Persist the open chunk and replace it with a fresh one
    async fn rotate(&mut self, trigger: &str) -> Result<Option<ChunkId>> {
        if self.chunk.is_empty() {
            return Ok(None);
        }

        let encoded = match self.chunk.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode chunk {}: {e}", self.chunk.id);
                self.retry_later();
                return Err(e);
            }
        };
        let id = self.chunk.id.clone();
        if let Err(e) = self.backend.put(id.as_str(), Bytes::from(encoded)).await {
            warn!(
                "Failed to flush chunk {id} ({} blocks, {trigger} trigger): {e}",
                self.chunk.len()
            );
            self.retry_later();
            return Err(e.into());
        }

        let closed = std::mem::take(&mut self.chunk);
        self.opened_at = None;

        if let Some(index) = &self.index {
            let scores: Vec<Score> = closed.scores().collect();
            if let Err(e) = index.put_chunk_refs(&closed.id, &scores) {
                error!("Failed to record chunk refs for {}: {e}", closed.id);
            }
        }

        self.stats.chunks_flushed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .blocks_flushed
            .fetch_add(closed.len() as u64, Ordering::Relaxed);
        info!(
            "Flushed chunk {} ({} blocks, {} bytes, {trigger} trigger)",
            closed.id,
            closed.len(),
            closed.data_bytes()
        );
        Ok(Some(closed.id))
    }

    /// Restart the idle window so a failing backend is not retried in a
    /// tight loop
    fn retry_later(&mut self) {
        self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.opened_at = Some(Instant::now());
    }
}
