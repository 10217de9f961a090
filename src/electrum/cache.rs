//! Time-boxed, size-bounded transaction cache keyed by txid.
//!
//! Eviction is FIFO over a persisted insertion-order index, so the cache
//! survives restarts with its ordering intact. Expiry is wall-clock
//! based and enforced both on read and by a periodic sweep. Whether a
//! cached view may be *reused* is the provider's decision (mempool views
//! never are); the cache itself only stores and ages entries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use super::TransactionView;
use crate::store::{KvStore, StoreError};

const ENTRY_PREFIX: &str = "tx:";
const INDEX_KEY: &[u8] = b"cache_index";

#[derive(Serialize, Deserialize)]
struct CachedTx {
    view: TransactionView,
    expires_at_ms: u64,
}

/// Bounded transaction cache over a named store instance.
pub struct TxCache {
    store: Arc<dyn KvStore>,
    max_entries: usize,
    ttl: Duration,
    /// Insertion order; its length is the authoritative entry count.
    index: Mutex<VecDeque<String>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TxCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        max_entries: usize,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        let index = match store.get(INDEX_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => VecDeque::new(),
        };
        Ok(Self {
            store,
            max_entries,
            ttl,
            index: Mutex::new(index),
            sweeper: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Fetch a cached view. Expired entries are dropped on read.
    pub fn get(&self, txid: &str) -> Result<Option<TransactionView>, StoreError> {
        let key = entry_key(txid);
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        let cached: CachedTx = bincode::deserialize(&bytes)?;
        if cached.expires_at_ms <= now_ms() {
            self.remove(txid)?;
            return Ok(None);
        }
        Ok(Some(cached.view))
    }

    /// Insert a view, evicting the FIFO head when at capacity. A caller
    /// may pin an explicit expiry; otherwise the configured TTL applies.
    pub fn set(
        &self,
        view: &TransactionView,
        expires_at_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let expires_at_ms =
            expires_at_ms.unwrap_or_else(|| now_ms() + self.ttl.as_millis() as u64);
        let entry = CachedTx {
            view: view.clone(),
            expires_at_ms,
        };
        let bytes = bincode::serialize(&entry)?;

        let mut index = self.index.lock();
        if !index.iter().any(|known| known == &view.txid) {
            while index.len() >= self.max_entries {
                let Some(oldest) = index.pop_front() else {
                    break;
                };
                self.store.delete(&entry_key(&oldest))?;
                debug!(txid = %oldest, "evicted oldest cache entry");
            }
            index.push_back(view.txid.clone());
        }
        self.store.put(&entry_key(&view.txid), &bytes)?;
        self.persist_index(&index)
    }

    pub fn remove(&self, txid: &str) -> Result<(), StoreError> {
        self.store.delete(&entry_key(txid))?;
        let mut index = self.index.lock();
        index.retain(|known| known != txid);
        self.persist_index(&index)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()?;
        self.index.lock().clear();
        Ok(())
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let snapshot: Vec<String> = self.index.lock().iter().cloned().collect();
        let mut removed = 0;
        for txid in snapshot {
            let Some(bytes) = self.store.get(&entry_key(&txid))? else {
                self.remove(&txid)?;
                continue;
            };
            let cached: CachedTx = bincode::deserialize(&bytes)?;
            if cached.expires_at_ms <= now {
                self.remove(&txid)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "cache sweep removed expired entries");
        }
        Ok(removed)
    }

    /// Start the periodic sweep task.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = cache.sweep() {
                    tracing::warn!(error = %err, "cache sweep failed");
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Cancel the sweeper and flush the backing store.
    pub fn stop(&self) -> Result<(), StoreError> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.store.flush()
    }

    fn persist_index(&self, index: &VecDeque<String>) -> Result<(), StoreError> {
        let bytes = bincode::serialize(index)?;
        self.store.put(INDEX_KEY, &bytes)
    }
}

fn entry_key(txid: &str) -> Vec<u8> {
    let mut key = ENTRY_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(txid.as_bytes());
    key
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
