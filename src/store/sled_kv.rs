use std::ops::Bound;
use std::path::Path;

use super::{KvStore, RangeQuery, StoreError};

/// Sled-backed store exposing named instances as trees.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create the database rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let db = sled::open(dir)?;
        Ok(Self { db })
    }

    /// Open the named instance, creating it on first use.
    pub fn tree(&self, name: &str) -> Result<SledTree, StoreError> {
        let tree = self.db.open_tree(name)?;
        Ok(SledTree { tree })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// One named key-value instance inside a [`SledStore`].
#[derive(Clone)]
pub struct SledTree {
    tree: sled::Tree,
}

impl KvStore for SledTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.tree.clear()?;
        Ok(())
    }

    fn entries(&self, range: &RangeQuery) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let lower = match &range.gt {
            Some(gt) => Bound::Excluded(gt.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &range.lt {
            Some(lt) => Bound::Excluded(lt.clone()),
            None => Bound::Unbounded,
        };
        let iter = self.tree.range((lower, upper));
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if range.reverse {
                Box::new(iter.rev())
            } else {
                Box::new(iter)
            };
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for entry in iter {
            let (key, value) = entry?;
            if skipped < range.offset {
                skipped += 1;
                continue;
            }
            out.push((key.to_vec(), value.to_vec()));
            if let Some(limit) = range.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.tree.flush()?;
        Ok(())
    }
}
