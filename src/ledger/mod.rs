//! Address balances, height-ordered transaction history and the
//! broadcast log, all persisted through the store abstraction.
//!
//! History keys are built for lexicographic range scans:
//! `i:<height zero-padded to 10>:<txid>` holds the view, `tx:<txid>`
//! holds the reverse height lookup. Rewriting a transaction at a new
//! height deletes the stale primary key first, which is how an entry
//! moves from the mempool into a block inside the index.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::electrum::TransactionView;
use crate::store::{KvStore, RangeQuery, StoreError};

pub mod balance;

pub use balance::{AddressEntry, Balance, BalanceSummary, Bucket};

const HISTORY_PREFIX: &str = "i:";
/// Upper bound for full-index scans: the byte after `:`.
const HISTORY_END: &str = "i;";
const REVERSE_PREFIX: &str = "tx:";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ledger corrupt: {0}")]
    Corrupt(String),
}

/// Paging options for [`AddressLedger::get_transactions`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TxQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    /// Newest first when set.
    pub reverse: bool,
}

/// Record of a transaction this wallet broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub txid: String,
    pub hex: String,
    pub created_at_ms: u64,
}

/// Per-address balances plus the transaction history index.
pub struct AddressLedger {
    addresses: Arc<dyn KvStore>,
    history: Arc<dyn KvStore>,
    broadcasted: Arc<dyn KvStore>,
    /// Serialises every read-modify-write so two handlers never observe a
    /// half-applied address entry.
    write_lock: Mutex<()>,
}

impl AddressLedger {
    pub fn new(
        addresses: Arc<dyn KvStore>,
        history: Arc<dyn KvStore>,
        broadcasted: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            addresses,
            history,
            broadcasted,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get_entry(&self, address: &str) -> Result<Option<AddressEntry>, LedgerError> {
        let Some(bytes) = self.addresses.get(address.as_bytes())? else {
            return Ok(None);
        };
        let entry = bincode::deserialize(&bytes)
            .map_err(|err| LedgerError::Corrupt(format!("address entry for {address}: {err}")))?;
        Ok(Some(entry))
    }

    /// Apply `mutate` to the address entry, creating it on first use.
    /// The whole read-modify-write happens under the ledger lock.
    pub fn update_entry<F>(&self, address: &str, mutate: F) -> Result<AddressEntry, LedgerError>
    where
        F: FnOnce(&mut AddressEntry),
    {
        let _guard = self.write_lock.lock();
        let mut entry = self.get_entry(address)?.unwrap_or_default();
        mutate(&mut entry);
        let bytes = bincode::serialize(&entry).map_err(StoreError::Codec)?;
        self.addresses.put(address.as_bytes(), &bytes)?;
        Ok(entry)
    }

    pub fn addresses(&self) -> Result<Vec<String>, LedgerError> {
        let entries = self.addresses.entries(&RangeQuery::default())?;
        entries
            .into_iter()
            .map(|(key, _)| {
                String::from_utf8(key)
                    .map_err(|err| LedgerError::Corrupt(format!("address key: {err}")))
            })
            .collect()
    }

    /// Insert or move a transaction in the history index.
    pub fn store_tx(&self, view: &TransactionView) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        let reverse_key = reverse_key(&view.txid);
        if let Some(bytes) = self.history.get(&reverse_key)? {
            let old_height = decode_height(&bytes, &view.txid)?;
            if old_height != view.height {
                self.history.delete(&history_key(old_height, &view.txid))?;
                debug!(txid = %view.txid, old_height, new_height = view.height, "moved history entry");
            }
        }
        let bytes = bincode::serialize(view).map_err(StoreError::Codec)?;
        self.history.put(&history_key(view.height, &view.txid), &bytes)?;
        self.history
            .put(&reverse_key, &view.height.to_be_bytes())?;
        Ok(())
    }

    pub fn get_tx(&self, txid: &str) -> Result<Option<TransactionView>, LedgerError> {
        let Some(bytes) = self.history.get(&reverse_key(txid))? else {
            return Ok(None);
        };
        let height = decode_height(&bytes, txid)?;
        let Some(bytes) = self.history.get(&history_key(height, txid))? else {
            return Err(LedgerError::Corrupt(format!(
                "dangling reverse lookup for {txid} at height {height}"
            )));
        };
        let view = bincode::deserialize(&bytes)
            .map_err(|err| LedgerError::Corrupt(format!("history entry for {txid}: {err}")))?;
        Ok(Some(view))
    }

    pub fn tx_height(&self, txid: &str) -> Result<Option<u64>, LedgerError> {
        match self.history.get(&reverse_key(txid))? {
            Some(bytes) => Ok(Some(decode_height(&bytes, txid)?)),
            None => Ok(None),
        }
    }

    /// Walk the history index in block order (or reverse block order).
    pub fn get_transactions(&self, query: TxQuery) -> Result<Vec<TransactionView>, LedgerError> {
        let mut range = RangeQuery::between(HISTORY_PREFIX, HISTORY_END).skip(query.offset);
        range.reverse = query.reverse;
        range.limit = query.limit;
        self.collect_views(&range)
    }

    /// All entries confirmed at exactly `height`.
    pub fn get_tx_height(&self, height: u64) -> Result<Vec<TransactionView>, LedgerError> {
        let range = RangeQuery::between(
            format!("{HISTORY_PREFIX}{height:010}"),
            format!("{HISTORY_PREFIX}{:010}", height + 1),
        );
        self.collect_views(&range)
    }

    /// Entries at heights in `(from, to]`, oldest first.
    pub fn get_tx_between(&self, from: u64, to: u64) -> Result<Vec<TransactionView>, LedgerError> {
        let range = RangeQuery::between(
            format!("{HISTORY_PREFIX}{:010};", from),
            format!("{HISTORY_PREFIX}{:010};", to),
        );
        self.collect_views(&range)
    }

    fn collect_views(&self, range: &RangeQuery) -> Result<Vec<TransactionView>, LedgerError> {
        self.history
            .entries(range)?
            .into_iter()
            .map(|(key, value)| {
                bincode::deserialize(&value).map_err(|err| {
                    LedgerError::Corrupt(format!(
                        "history entry {}: {err}",
                        String::from_utf8_lossy(&key)
                    ))
                })
            })
            .collect()
    }

    /// Persist a transaction this wallet sent out.
    pub fn record_broadcast(&self, txid: &str, hex: &str) -> Result<(), LedgerError> {
        let record = BroadcastRecord {
            txid: txid.to_string(),
            hex: hex.to_string(),
            created_at_ms: now_ms(),
        };
        let bytes = bincode::serialize(&record).map_err(StoreError::Codec)?;
        self.broadcasted.put(txid.as_bytes(), &bytes)?;
        Ok(())
    }

    pub fn broadcasts(&self) -> Result<Vec<BroadcastRecord>, LedgerError> {
        self.broadcasted
            .entries(&RangeQuery::default())?
            .into_iter()
            .map(|(key, value)| {
                bincode::deserialize(&value).map_err(|err| {
                    LedgerError::Corrupt(format!(
                        "broadcast record {}: {err}",
                        String::from_utf8_lossy(&key)
                    ))
                })
            })
            .collect()
    }
}

fn history_key(height: u64, txid: &str) -> Vec<u8> {
    format!("{HISTORY_PREFIX}{height:010}:{txid}").into_bytes()
}

fn reverse_key(txid: &str) -> Vec<u8> {
    format!("{REVERSE_PREFIX}{txid}").into_bytes()
}

fn decode_height(bytes: &[u8], txid: &str) -> Result<u64, LedgerError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| LedgerError::Corrupt(format!("height encoding for {txid}")))?;
    Ok(u64::from_be_bytes(arr))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::store::MemoryStore;

    fn ledger() -> AddressLedger {
        AddressLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn view(txid: &str, height: u64) -> TransactionView {
        TransactionView {
            txid: txid.to_string(),
            height,
            outputs: Vec::new(),
            inputs: Vec::new(),
            fee: Amount::ZERO,
            std_out: Vec::new(),
            std_in: Vec::new(),
            unconfirmed_inputs: Vec::new(),
            coinbase: false,
        }
    }

    #[test]
    fn store_tx_round_trips() {
        let ledger = ledger();
        ledger.store_tx(&view("aa", 120)).expect("store");
        let stored = ledger.get_tx("aa").expect("get").expect("present");
        assert_eq!(stored.height, 120);
        assert_eq!(ledger.tx_height("aa").expect("height"), Some(120));
    }

    #[test]
    fn moving_heights_leaves_no_stale_keys() {
        let ledger = ledger();
        ledger.store_tx(&view("aa", 0)).expect("mempool");
        ledger.store_tx(&view("aa", 120)).expect("confirmed");

        assert!(ledger.get_tx_height(0).expect("scan 0").is_empty());
        assert_eq!(ledger.get_tx_height(120).expect("scan 120").len(), 1);
        assert_eq!(ledger.get_transactions(TxQuery::default()).expect("all").len(), 1);

        // A one-block move must also clean up.
        ledger.store_tx(&view("aa", 121)).expect("reindexed");
        assert!(ledger.get_tx_height(120).expect("scan 120").is_empty());
        assert_eq!(ledger.tx_height("aa").expect("height"), Some(121));
    }

    #[test]
    fn history_walks_in_block_order() {
        let ledger = ledger();
        ledger.store_tx(&view("cc", 300)).expect("store");
        ledger.store_tx(&view("aa", 100)).expect("store");
        ledger.store_tx(&view("bb", 200)).expect("store");

        let forward = ledger.get_transactions(TxQuery::default()).expect("forward");
        let heights: Vec<u64> = forward.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![100, 200, 300]);

        let newest = ledger
            .get_transactions(TxQuery {
                limit: Some(2),
                offset: 0,
                reverse: true,
            })
            .expect("reverse");
        let heights: Vec<u64> = newest.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![300, 200]);

        let paged = ledger
            .get_transactions(TxQuery {
                limit: Some(1),
                offset: 1,
                reverse: false,
            })
            .expect("paged");
        assert_eq!(paged[0].height, 200);
    }

    #[test]
    fn height_window_scans() {
        let ledger = ledger();
        for (txid, height) in [("aa", 100), ("bb", 101), ("cc", 103)] {
            ledger.store_tx(&view(txid, height)).expect("store");
        }
        let between = ledger.get_tx_between(100, 103).expect("between");
        let heights: Vec<u64> = between.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![101, 103]);
    }

    #[test]
    fn update_entry_creates_and_persists() {
        let ledger = ledger();
        ledger
            .update_entry("bcrt1qaa", |entry| {
                entry
                    .incoming
                    .add_txid(Bucket::Mempool, "aa", Amount::from_sats(500));
            })
            .expect("update");
        let entry = ledger.get_entry("bcrt1qaa").expect("get").expect("present");
        assert_eq!(entry.incoming.mempool.to_sats(), 500);
        assert_eq!(ledger.addresses().expect("addresses"), vec!["bcrt1qaa"]);
    }

    #[test]
    fn broadcast_log_round_trips() {
        let ledger = ledger();
        ledger.record_broadcast("aa", "beef").expect("record");
        let records = ledger.broadcasts().expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid, "aa");
        assert_eq!(records[0].hex, "beef");
    }
}
