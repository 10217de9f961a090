//! Key-value storage abstraction backing the ledger, the sync state and
//! the transaction cache.
//!
//! Named instances are lexicographically ordered byte maps with range
//! scans; the wallet never assumes anything else about the backend.

use thiserror::Error;

pub mod memory;
pub mod sled_kv;

pub use memory::MemoryStore;
pub use sled_kv::{SledStore, SledTree};

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Lexicographic range selector for [`KvStore::entries`].
///
/// `gt`/`lt` are exclusive bounds; either may be omitted. `offset` entries
/// are skipped before up to `limit` entries are yielded, walking forward
/// or in reverse byte order.
#[derive(Clone, Debug, Default)]
pub struct RangeQuery {
    pub gt: Option<Vec<u8>>,
    pub lt: Option<Vec<u8>>,
    pub reverse: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RangeQuery {
    pub fn between(gt: impl Into<Vec<u8>>, lt: impl Into<Vec<u8>>) -> Self {
        Self {
            gt: Some(gt.into()),
            lt: Some(lt.into()),
            ..Self::default()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn skip(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single named key-value instance.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
    /// Range scan in lexicographic byte order.
    fn entries(&self, range: &RangeQuery) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

pub(crate) fn in_range(key: &[u8], range: &RangeQuery) -> bool {
    if let Some(gt) = &range.gt {
        if key <= gt.as_slice() {
            return false;
        }
    }
    if let Some(lt) = &range.lt {
        if key >= lt.as_slice() {
            return false;
        }
    }
    true
}
