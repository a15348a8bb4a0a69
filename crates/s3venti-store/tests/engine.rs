//! End-to-end behaviour of the block store over in-memory tiers

use bytes::Bytes;
use rand::RngCore;
use s3venti_common::config::{BatchConfig, WriteStrategy};
use s3venti_common::{Chunk, ContentAddresser, Error, Score};
use s3venti_store::maintenance::{DEFAULT_OBJECT_LIST_KEY, rebuild_chunk_refs};
use s3venti_store::{BlockStore, LocalIndex, MemoryBackend, MemoryCache, SharedCache, marker_key};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    index: Arc<LocalIndex>,
    shared: Arc<MemoryCache>,
    backend: Arc<MemoryBackend>,
    store: BlockStore,
}

fn batching(strategy: WriteStrategy) -> BatchConfig {
    BatchConfig {
        strategy,
        max_blocks: 64,
        ..BatchConfig::default()
    }
}

fn harness(strategy: WriteStrategy) -> Harness {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(LocalIndex::open(dir.path().join("scores.db")).unwrap());
    let shared = Arc::new(MemoryCache::new());
    let backend = Arc::new(MemoryBackend::new());
    let store = BlockStore::new(
        index.clone(),
        shared.clone(),
        backend.clone(),
        &batching(strategy),
    );
    Harness {
        dir,
        index,
        shared,
        backend,
        store,
    }
}

fn random_block(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

#[test]
fn score_is_deterministic_across_addressers() {
    let data = random_block(4096);
    let a = ContentAddresser::new(1);
    let b = ContentAddresser::new(32);
    let first = a.score(&data);
    for _ in 0..4 {
        assert_eq!(a.score(&data), first);
        assert_eq!(b.score(&data), first);
    }
    assert_eq!(Score::compute(&data), first);
}

#[tokio::test]
async fn duplicate_write_persists_once() {
    let h = harness(WriteStrategy::Direct);
    let data = random_block(512);

    let first = h.store.write(3, data.clone()).await.unwrap();
    let second = h.store.write(7, data.clone()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.backend.puts(), 1);
    assert_eq!(h.store.stats().dedup_hits.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn read_after_write_direct() {
    let h = harness(WriteStrategy::Direct);
    for len in [0, 1, 100, 8192] {
        let data = random_block(len);
        let score = h.store.write(0, data.clone()).await.unwrap();
        assert_eq!(h.store.read(&score, len).await.unwrap(), data);
        assert_eq!(h.backend.object(&score.to_hex()).unwrap(), data);
    }
}

#[tokio::test]
async fn read_after_write_batched() {
    let h = harness(WriteStrategy::Batched);
    let blocks: Vec<Bytes> = (0..10).map(|i| random_block(64 + i)).collect();

    let mut scores = Vec::new();
    for data in &blocks {
        scores.push(h.store.write(0, data.clone()).await.unwrap());
    }
    h.store.sync().await.unwrap();

    for (score, data) in scores.iter().zip(&blocks) {
        assert_eq!(h.store.read(score, data.len()).await.unwrap(), *data);
    }

    // One chunk object, no per-score objects
    let keys = h.backend.keys();
    assert_eq!(keys.len(), 1);
    let chunk = Chunk::decode(&h.backend.object(&keys[0]).unwrap()).unwrap();
    assert_eq!(chunk.len(), blocks.len());
    for score in &scores {
        assert!(h.backend.object(&score.to_hex()).is_none());
        assert_eq!(h.index.chunk_for(score).unwrap().unwrap(), chunk.id);
    }
    h.store.close().await.unwrap();
}

#[tokio::test]
async fn batched_size_trigger_produces_several_chunks() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(LocalIndex::open(dir.path().join("scores.db")).unwrap());
    let backend = Arc::new(MemoryBackend::new());
    let store = BlockStore::new(
        index,
        Arc::new(MemoryCache::new()),
        backend.clone(),
        &BatchConfig {
            strategy: WriteStrategy::Batched,
            max_blocks: 3,
            ..BatchConfig::default()
        },
    );

    for i in 0..10u32 {
        store.write(0, Bytes::from(i.to_be_bytes().to_vec())).await.unwrap();
    }
    store.close().await.unwrap();

    assert!(backend.keys().len() > 1);
}

#[tokio::test]
async fn read_truncates_to_requested_count() {
    let h = harness(WriteStrategy::Direct);
    let data = Bytes::from_static(b"0123456789");
    let score = h.store.write(0, data.clone()).await.unwrap();

    assert_eq!(h.store.read(&score, 4).await.unwrap(), &b"0123"[..]);
    assert_eq!(h.store.read(&score, 0).await.unwrap(), Bytes::new());
    assert_eq!(h.store.read(&score, 10).await.unwrap(), data);
    assert_eq!(h.store.read(&score, 1 << 20).await.unwrap(), data);
}

#[tokio::test]
async fn durable_hit_backfills_local_index() {
    let h = harness(WriteStrategy::Direct);
    let data = random_block(256);
    let score = Score::compute(&data);
    h.backend.insert(score.to_hex(), data.clone());

    assert_eq!(h.store.read(&score, data.len()).await.unwrap(), data);
    assert_eq!(h.backend.gets(), 1);
    assert!(h.index.contains(&score).unwrap());
    assert!(h.shared.contains(&score.to_hex()));
    assert!(h.shared.contains(&marker_key(&score)));

    assert_eq!(h.store.read(&score, data.len()).await.unwrap(), data);
    assert_eq!(h.backend.gets(), 1);
    assert_eq!(h.store.stats().index_hits.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn shared_hit_backfills_local_index() {
    let h = harness(WriteStrategy::Direct);
    let data = random_block(128);
    let score = Score::compute(&data);
    h.shared.set(&score.to_hex(), data.clone()).await;

    assert_eq!(h.store.read(&score, 128).await.unwrap(), data);
    assert_eq!(h.backend.gets(), 0);
    assert!(h.index.contains(&score).unwrap());
}

#[tokio::test]
async fn unknown_score_is_not_found_without_mutation() {
    let h = harness(WriteStrategy::Direct);
    let score = Score::compute(b"never written");

    let err = h.store.read(&score, 100).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { score: s } if s == score));
    assert_eq!(h.backend.puts(), 0);
    assert!(h.backend.is_empty());
    assert!(h.index.is_empty().unwrap());
    assert_eq!(h.store.stats().not_found.load(Ordering::Relaxed), 1);

    let batched = harness(WriteStrategy::Batched);
    let err = batched.store.read(&score, 100).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    batched.store.close().await.unwrap();
    assert_eq!(batched.backend.puts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_writes_agree() {
    let h = harness(WriteStrategy::Direct);
    let store = Arc::new(h.store);
    let data = random_block(1024);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let store = Arc::clone(&store);
            let data = data.clone();
            tokio::spawn(async move { store.write(0, data).await.unwrap() })
        })
        .collect();
    let scores = futures::future::join_all(tasks).await;

    let expected = Score::compute(&data);
    for score in scores {
        assert_eq!(score.unwrap(), expected);
    }
    // Racing writers may each put, but only into the one object
    assert_eq!(h.backend.keys(), vec![expected.to_hex()]);
    assert!(h.backend.puts() >= 1);
}

#[tokio::test]
async fn flushed_chunks_resolve_after_index_rebuild() {
    let h = harness(WriteStrategy::Batched);
    let data = random_block(300);
    let score = h.store.write(0, data.clone()).await.unwrap();
    h.store.close().await.unwrap();

    // A fresh process with an empty local index and a cold shared cache
    let index = Arc::new(LocalIndex::open(h.dir.path().join("rebuilt.db")).unwrap());
    let report = rebuild_chunk_refs(h.backend.as_ref(), &index, DEFAULT_OBJECT_LIST_KEY)
        .await
        .unwrap();
    assert_eq!(report.refs, 1);

    let store = BlockStore::new(
        index.clone(),
        Arc::new(MemoryCache::new()),
        h.backend.clone(),
        &batching(WriteStrategy::Batched),
    );
    assert_eq!(store.read(&score, data.len()).await.unwrap(), data);
    assert!(index.contains(&score).unwrap());

    // Rewriting the same content is recognized through the chunk refs
    let before = h.backend.puts();
    store.write(0, data).await.unwrap();
    store.close().await.unwrap();
    assert_eq!(h.backend.puts(), before);
}

#[tokio::test]
async fn closed_batched_store_still_serves_reads() {
    let h = harness(WriteStrategy::Batched);
    let data = random_block(200);
    let other = random_block(150);
    let score = h.store.write(0, data.clone()).await.unwrap();
    let other_score = h.store.write(0, other.clone()).await.unwrap();
    h.store.close().await.unwrap();

    let index = Arc::new(LocalIndex::open(h.dir.path().join("cold.db")).unwrap());
    rebuild_chunk_refs(h.backend.as_ref(), &index, DEFAULT_OBJECT_LIST_KEY)
        .await
        .unwrap();
    let store = BlockStore::new(
        index.clone(),
        Arc::new(MemoryCache::new()),
        h.backend.clone(),
        &batching(WriteStrategy::Batched),
    );
    store.close().await.unwrap();

    assert_eq!(store.read(&score, 100).await.unwrap(), data.slice(..100));

    let unknown = Score::compute(b"never written");
    let err = store.read(&unknown, 100).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    // Dedup of a flushed block needs no open chunk
    assert!(!index.contains(&other_score).unwrap());
    let before = h.backend.puts();
    assert_eq!(store.write(0, other).await.unwrap(), other_score);
    assert_eq!(h.backend.puts(), before);
}

#[tokio::test]
async fn local_index_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scores.db");
    let backend = Arc::new(MemoryBackend::new());
    let data = random_block(64);

    let score = {
        let store = BlockStore::new(
            Arc::new(LocalIndex::open(&path).unwrap()),
            Arc::new(MemoryCache::new()),
            backend.clone(),
            &batching(WriteStrategy::Direct),
        );
        store.write(0, data.clone()).await.unwrap()
    };

    let store = BlockStore::new(
        Arc::new(LocalIndex::open(&path).unwrap()),
        Arc::new(MemoryCache::new()),
        backend.clone(),
        &batching(WriteStrategy::Direct),
    );
    assert_eq!(store.read(&score, 64).await.unwrap(), data);
    assert_eq!(backend.gets(), 0);
}
