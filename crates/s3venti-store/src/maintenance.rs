//! Offline maintenance jobs
//!
//! None of these run on the request path. They are driven by the CLI:
//! - build an archival list of every durable key and store it as one object
//! - read that list back
//! - pre-warm shared-cache existence markers from a key list
//! - rebuild the local score → chunk refs from the chunk objects

use crate::backend::DurableBackend;
use crate::cache::{SharedCache, marker_key};
use crate::index::LocalIndex;
use bytes::Bytes;
use s3venti_common::{Chunk, ChunkId, Error, Result, Score};
use tracing::{debug, info, warn};

/// Object key the key list is stored under
pub const DEFAULT_OBJECT_LIST_KEY: &str = "allKeys.bin";

/// List every key under `prefix`, store the sorted list under `list_key`
/// and return it. The list object itself is left out of the list.
pub async fn build_object_list(
    backend: &dyn DurableBackend,
    prefix: &str,
    list_key: &str,
) -> Result<Vec<String>> {
    let mut keys = backend.list_all(prefix).await?;
    keys.retain(|k| k != list_key);
    keys.sort_unstable();

    let encoded = bincode::serialize(&keys)?;
    info!(
        "Storing list of {} keys ({} bytes) as {list_key}",
        keys.len(),
        encoded.len()
    );
    backend.put(list_key, Bytes::from(encoded)).await?;
    Ok(keys)
}

/// Fetch and decode a list written by [`build_object_list`]
pub async fn load_object_list(backend: &dyn DurableBackend, list_key: &str) -> Result<Vec<String>> {
    let bytes = backend.get(list_key).await?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Set an existence marker for every key that is a score. Other keys
/// (chunk objects, the list itself) are skipped. Returns the number of
/// markers set.
pub async fn warm_markers(shared: &dyn SharedCache, keys: &[String]) -> usize {
    let mut warmed = 0;
    for key in keys {
        let Ok(score) = key.parse::<Score>() else {
            debug!("Skipping non-score key {key}");
            continue;
        };
        shared.set(&marker_key(&score), Bytes::new()).await;
        warmed += 1;
    }
    info!("Warmed {warmed} of {} existence markers", keys.len());
    warmed
}

/// Outcome of [`rebuild_chunk_refs`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Chunk objects decoded and indexed
    pub chunks: usize,
    /// Score → chunk refs written
    pub refs: usize,
    /// Objects that were not chunks
    pub skipped: usize,
}

/// Re-read every chunk object and record its score → chunk refs in `index`.
///
/// Per-score objects from the direct layout are recognized by their key and
/// skipped without a fetch; anything else that fails to decode as a chunk
/// is skipped with a warning.
pub async fn rebuild_chunk_refs(
    backend: &dyn DurableBackend,
    index: &LocalIndex,
    list_key: &str,
) -> Result<RebuildReport> {
    let mut report = RebuildReport::default();

    for key in backend.list_all("").await? {
        if key == list_key || key.parse::<Score>().is_ok() {
            report.skipped += 1;
            continue;
        }

        let bytes = backend.get(&key).await?;
        let chunk = match Chunk::decode(&bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Skipping {key}: not a chunk ({e})");
                report.skipped += 1;
                continue;
            }
        };

        let scores: Vec<Score> = chunk.scores().collect();
        index
            .put_chunk_refs(&ChunkId::from(key.as_str()), &scores)
            .map_err(Error::from)?;
        report.chunks += 1;
        report.refs += scores.len();
    }

    info!(
        "Rebuilt {} chunk refs from {} chunks ({} objects skipped)",
        report.refs, report.chunks, report.skipped
    );
    Ok(report)
}
