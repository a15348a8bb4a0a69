//! In-memory durable backend
//!
//! Not durable at all; used by tests (with call counters and failure
//! injection) and for running the server without an object store.

use super::{BackendError, BackendResult, DurableBackend};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Call counters for [`MemoryBackend`]
#[derive(Debug, Default)]
pub struct MemoryBackendStats {
    pub exists: AtomicU64,
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub lists: AtomicU64,
}

/// Map-backed implementation of [`DurableBackend`]
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, Bytes>>,
    stats: MemoryBackendStats,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transport error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Call counters
    pub fn stats(&self) -> &MemoryBackendStats {
        &self.stats
    }

    /// Number of `put` calls so far
    pub fn puts(&self) -> u64 {
        self.stats.puts.load(Ordering::SeqCst)
    }

    /// Number of `get` calls so far
    pub fn gets(&self) -> u64 {
        self.stats.gets.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Stored object, bypassing the counters
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).cloned()
    }

    /// All stored keys in order, bypassing the counters
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Seed an object, bypassing the counters
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(key.into(), data.into());
    }

    fn check(&self) -> BackendResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.stats.exists.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn get(&self, key: &str) -> BackendResult<Bytes> {
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn list_all(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.stats.lists.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
