//! Local index backed by redb
//!
//! Two tables:
//! - `blocks`: raw score bytes → raw block data. Consulted first on every
//!   read and backfilled after every slower-tier hit.
//! - `chunk_refs`: raw score bytes → chunk id. Written after each batched
//!   flush so blocks in closed chunks stay resolvable.
//!
//! Every write is one transaction (begin → insert → commit); a failed insert
//! aborts the transaction so the index is never left half-written.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use s3venti_common::{ChunkId, Error, Score};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");
const CHUNK_REFS: TableDefinition<&[u8], &str> = TableDefinition::new("chunk_refs");

/// Error type for local index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        Error::LocalIndex(e.to_string())
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Persistent score → data mirror of everything this process has touched
pub struct LocalIndex {
    db: Database,
    path: PathBuf,
}

impl LocalIndex {
    /// Open (or create) the index at `path`, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(BLOCKS)?;
            let _t = write_txn.open_table(CHUNK_REFS)?;
        }
        write_txn.commit()?;

        info!("Local index opened at {}", path.display());
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data stored for `score`, if any
    pub fn get(&self, score: &Score) -> IndexResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS)?;
        Ok(table
            .get(score.as_bytes().as_slice())?
            .map(|guard| guard.value().to_vec()))
    }

    /// Whether `score` has data in the index
    pub fn contains(&self, score: &Score) -> IndexResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS)?;
        Ok(table.get(score.as_bytes().as_slice())?.is_some())
    }

    /// Store `data` under `score` in a single transaction
    pub fn set(&self, score: &Score, data: &[u8]) -> IndexResult<()> {
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(BLOCKS)?;
            table.insert(score.as_bytes().as_slice(), data).map(|_| ())
        };
        if let Err(e) = inserted {
            write_txn.abort()?;
            return Err(e.into());
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Record that every score in `scores` lives in chunk `id`
    pub fn put_chunk_refs(&self, id: &ChunkId, scores: &[Score]) -> IndexResult<()> {
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(CHUNK_REFS)?;
            scores
                .iter()
                .try_for_each(|score| table.insert(score.as_bytes().as_slice(), id.as_str()).map(|_| ()))
        };
        if let Err(e) = inserted {
            write_txn.abort()?;
            return Err(e.into());
        }
        write_txn.commit()?;
        debug!("Recorded {} chunk refs for {id}", scores.len());
        Ok(())
    }

    /// Chunk holding `score`, if it was flushed through a batcher
    pub fn chunk_for(&self, score: &Score) -> IndexResult<Option<ChunkId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHUNK_REFS)?;
        Ok(table
            .get(score.as_bytes().as_slice())?
            .map(|guard| ChunkId::from(guard.value())))
    }

    /// Number of blocks with data in the index
    pub fn len(&self) -> IndexResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of recorded score → chunk references
    pub fn chunk_ref_count(&self) -> IndexResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHUNK_REFS)?;
        Ok(table.len()?)
    }
}
