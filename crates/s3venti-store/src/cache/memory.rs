//! In-memory shared cache for tests and single-process deployments

use super::SharedCache;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Map-backed implementation of [`SharedCache`]
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Bytes>>,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry, as an eviction would
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Whether `key` is cached, bypassing the counters
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of `get` calls so far
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `set` calls so far
    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.entries.read().get(key).cloned()
    }

    async fn set(&self, key: &str, data: Bytes) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(key.to_string(), data);
    }
}
