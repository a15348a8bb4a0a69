//! Shared cache abstraction
//!
//! The shared cache is a remote, low-latency, best-effort key → bytes store
//! shared by every s3venti process. Nothing about it is authoritative: a miss
//! never means the block is absent from the durable backend, and failures
//! are reported as misses.
//!
//! Two kinds of entries live here: full block data under the score's hex
//! rendering, and zero-byte existence markers under [`marker_key`] so that
//! dedup checks can skip the durable `exists` round-trip.

pub mod memcached;
pub mod memory;

pub use memcached::MemcachedCache;
pub use memory::MemoryCache;

use async_trait::async_trait;
use bytes::Bytes;
use s3venti_common::Score;
use s3venti_common::config::SharedCacheConfig;
use std::sync::Arc;
use tracing::info;

/// Remote best-effort key/value cache
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Fetch `key`; `None` on miss or on any failure
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `data` under `key`; failures are swallowed
    async fn set(&self, key: &str, data: Bytes);
}

/// Key of the existence marker for `score`
#[must_use]
pub fn marker_key(score: &Score) -> String {
    format!("{score}.exists")
}

/// Cache used when no shared cache is configured: always misses
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl SharedCache for NoopCache {
    async fn get(&self, _key: &str) -> Option<Bytes> {
        None
    }

    async fn set(&self, _key: &str, _data: Bytes) {}
}

/// Build the configured shared cache
#[must_use]
pub fn build(config: &SharedCacheConfig) -> Arc<dyn SharedCache> {
    match &config.address {
        Some(address) => {
            info!("Shared cache: memcached at {address}");
            Arc::new(MemcachedCache::new(address.clone()))
        }
        None => {
            info!("Shared cache: disabled");
            Arc::new(NoopCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_key_differs_from_block_key() {
        let score = Score::compute(b"abc");
        assert_eq!(
            marker_key(&score),
            "a9993e364706816aba3e25717850c26c9cd0d89d.exists"
        );
        assert_ne!(marker_key(&score), score.to_hex());
    }

    #[tokio::test]
    async fn test_noop_cache_always_misses() {
        let cache = NoopCache;
        cache.set("k", Bytes::from_static(b"v")).await;
        assert!(cache.get("k").await.is_none());
    }
}
