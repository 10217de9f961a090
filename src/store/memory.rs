use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{in_range, KvStore, RangeQuery, StoreError};

/// In-memory store used by unit tests and ephemeral wallets.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.map.lock().clear();
        Ok(())
    }

    fn entries(&self, range: &RangeQuery) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.map.lock();
        let matching: Vec<(Vec<u8>, Vec<u8>)> = map
            .iter()
            .filter(|(key, _)| in_range(key, range))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let iter: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>> = if range.reverse {
            Box::new(matching.into_iter().rev())
        } else {
            Box::new(matching.into_iter())
        };
        let iter = iter.skip(range.offset);
        Ok(match range.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
