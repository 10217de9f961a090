//! Scan orchestration: gap-limit discovery, subscription upkeep, ledger
//! application and the wallet's UTXO set.
//!
//! One sync manager owns the ledger, the watched-address lists and the
//! UTXO locks. Transaction application is serialised through the ledger,
//! so per-address updates are linearizable even though RPC traffic for
//! different addresses interleaves freely.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::config::PolicyConfig;
use crate::electrum::provider::ProviderError;
use crate::electrum::{Provider, TransactionView, TxOptions};
use crate::events::WalletEvent;
use crate::keys::{Chain, DerivedKey, HdPath, KeyError, KeyManager, ScriptHash};
use crate::ledger::{AddressLedger, BalanceSummary, Bucket, LedgerError};
use crate::store::{KvStore, RangeQuery, StoreError};

const META_SYNC_STATE: &[u8] = b"sync_state";
const META_WATCHED_EXTERNAL: &[u8] = b"watched_script_hashes_ext";
const META_WATCHED_INTERNAL: &[u8] = b"watched_script_hashes_in";
const META_LATEST_BLOCK: &[u8] = b"latest_block";
const META_RECEIVE_BALANCE: &[u8] = b"receive_balance";
const META_TOTAL_BALANCE: &[u8] = b"total_balance";

const UTXO_PREFIX: &str = "u:";
const UTXO_END: &str = "u;";
const SPENT_PREFIX: &str = "s:";

/// Walker progress for one chain: the trailing empty-run counter, the
/// first address of the last observed empty run, and the next path to
/// scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub gap: u32,
    pub gap_end: u32,
    pub path: HdPath,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct ScanStates {
    external: SyncState,
    internal: SyncState,
}

/// An unspent output owned by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub index: u32,
    pub value: Amount,
    pub script_hex: String,
    pub address: String,
    pub path: HdPath,
    pub public_key: Vec<u8>,
    pub height: u64,
}

/// Coin-selection result: the locked inputs and their combined value.
#[derive(Clone, Debug)]
pub struct UtxoSelection {
    pub utxos: Vec<Utxo>,
    pub total: Amount,
}

/// Watched address: the subscription key plus the derivation behind it.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WatchedAddress {
    script_hash: ScriptHash,
    address: String,
    path: HdPath,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncOptions {
    /// Restart discovery from index zero on both chains.
    pub reset: bool,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },
    #[error("reorg detected: announced height {announced} below current {current}")]
    ReorgDetected { current: u64, announced: u64 },
    #[error("a sync cycle is already running")]
    SyncInProgress,
}

/// Drives scan cycles and keeps the ledger consistent with the chain.
pub struct SyncManager {
    provider: Arc<Provider>,
    keys: Arc<dyn KeyManager>,
    ledger: Arc<AddressLedger>,
    meta: Arc<dyn KvStore>,
    utxo_store: Arc<dyn KvStore>,
    states: Mutex<Option<ScanStates>>,
    watched_external: Mutex<Vec<WatchedAddress>>,
    watched_internal: Mutex<Vec<WatchedAddress>>,
    locked: Mutex<HashSet<(String, u32)>>,
    current_block: AtomicU64,
    base_path: HdPath,
    gap_limit: u32,
    min_confirmations: u64,
    allow_unconfirmed_spends: bool,
    is_syncing: AtomicBool,
    stop_requested: AtomicBool,
    events_tx: broadcast::Sender<WalletEvent>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<Provider>,
        keys: Arc<dyn KeyManager>,
        ledger: Arc<AddressLedger>,
        meta: Arc<dyn KvStore>,
        utxo_store: Arc<dyn KvStore>,
        policy: &PolicyConfig,
        base_path: HdPath,
        events_tx: broadcast::Sender<WalletEvent>,
    ) -> Self {
        Self {
            provider,
            keys,
            ledger,
            meta,
            utxo_store,
            states: Mutex::new(None),
            watched_external: Mutex::new(Vec::new()),
            watched_internal: Mutex::new(Vec::new()),
            locked: Mutex::new(HashSet::new()),
            current_block: AtomicU64::new(0),
            base_path,
            gap_limit: policy.gap_limit,
            min_confirmations: policy.min_confirmations,
            allow_unconfirmed_spends: policy.allow_unconfirmed_spends,
            is_syncing: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            events_tx,
        }
    }

    /// Load persisted sync state, watched lists and the last known tip.
    pub fn init(&self) -> Result<(), SyncError> {
        let states = match self.meta.get(META_SYNC_STATE)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(StoreError::Codec)?,
            None => self.fresh_states(),
        };
        *self.states.lock() = Some(states);

        *self.watched_external.lock() = self.load_watched(META_WATCHED_EXTERNAL)?;
        *self.watched_internal.lock() = self.load_watched(META_WATCHED_INTERNAL)?;

        if let Some(bytes) = self.meta.get(META_LATEST_BLOCK)? {
            let height: u64 = bincode::deserialize(&bytes).map_err(StoreError::Codec)?;
            self.current_block.store(height, Ordering::SeqCst);
        }
        self.emit(WalletEvent::Ready);
        Ok(())
    }

    fn fresh_states(&self) -> ScanStates {
        let fresh = |chain| SyncState {
            gap: 0,
            gap_end: 0,
            path: self.base_path.with_chain(chain).with_index(0),
        };
        ScanStates {
            external: fresh(Chain::External),
            internal: fresh(Chain::Internal),
        }
    }

    fn load_watched(&self, key: &[u8]) -> Result<Vec<WatchedAddress>, SyncError> {
        Ok(match self.meta.get(key)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(StoreError::Codec)?,
            None => Vec::new(),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: WalletEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn current_block(&self) -> u64 {
        self.current_block.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Request a cooperative stop; polled between addresses.
    pub fn stop_sync(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn resume_sync(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Stop scanning and wait for the in-flight cycle to drain.
    pub async fn shutdown(&self) {
        self.stop_sync();
        while self.is_syncing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn sync_state(&self, chain: Chain) -> Option<SyncState> {
        (*self.states.lock()).map(|states| match chain {
            Chain::External => states.external,
            Chain::Internal => states.internal,
        })
    }

    /// Run a gap-limit scan over one chain.
    ///
    /// Every non-empty address is watched, its confirmed and mempool
    /// history deduplicated by txid and applied to the ledger. The scan
    /// stops once `gap_limit` consecutive addresses come back empty, or
    /// earlier when a stop was requested; progress persists either way.
    pub async fn sync_account(&self, chain: Chain, opts: SyncOptions) -> Result<(), SyncError> {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            return Err(SyncError::SyncInProgress);
        }
        let outcome = self.scan_chain(chain, opts).await;
        self.is_syncing.store(false, Ordering::SeqCst);
        self.emit(WalletEvent::SyncEnd);
        outcome
    }

    async fn scan_chain(&self, chain: Chain, opts: SyncOptions) -> Result<(), SyncError> {
        if opts.reset {
            let fresh = self.fresh_states();
            *self.states.lock() = Some(fresh);
            self.persist_states()?;
        }
        let mut state = self.sync_state(chain).unwrap_or_else(|| {
            let fresh = self.fresh_states();
            match chain {
                Chain::External => fresh.external,
                Chain::Internal => fresh.internal,
            }
        });
        info!(%chain, start_index = state.path.index, "starting gap-limit scan");

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!(%chain, "scan stopped at address boundary");
                break;
            }
            let path = state.path;
            let derived = self.keys.derive(&path)?;
            let has_history = self.provider.has_history(&derived.script_hash).await?;
            if has_history {
                state.gap = 0;
                self.watch_address(&derived, chain).await?;
                let views = self.fetch_address_views(&derived.script_hash).await?;
                for view in &views {
                    self.apply_transaction(view)?;
                }
                self.emit(WalletEvent::SyncedPath {
                    chain,
                    path: path.to_string(),
                });
            } else {
                state.gap += 1;
            }
            state.path = path.bump_index();
            if state.gap >= self.gap_limit {
                state.gap_end = path.index + 1 - self.gap_limit;
                self.store_state(chain, state)?;
                break;
            }
            self.store_state(chain, state)?;
        }
        self.recompute_balances()?;
        info!(%chain, gap = state.gap, gap_end = state.gap_end, "scan finished");
        Ok(())
    }

    /// Confirmed plus mempool views for one script hash, deduplicated.
    async fn fetch_address_views(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TransactionView>, SyncError> {
        let opts = TxOptions::default();
        let mut views = self.provider.get_address_history(script_hash, opts).await?;
        views.extend(self.provider.get_mempool_tx(script_hash, opts).await?);
        let mut seen = HashSet::new();
        views.retain(|view| seen.insert(view.txid.clone()));
        Ok(views)
    }

    fn store_state(&self, chain: Chain, state: SyncState) -> Result<(), SyncError> {
        {
            let mut states = self.states.lock();
            let mut current = (*states).unwrap_or_else(|| self.fresh_states());
            match chain {
                Chain::External => current.external = state,
                Chain::Internal => current.internal = state,
            }
            *states = Some(current);
        }
        self.persist_states()
    }

    fn persist_states(&self) -> Result<(), SyncError> {
        let states = (*self.states.lock()).unwrap_or_else(|| self.fresh_states());
        let bytes = bincode::serialize(&states).map_err(StoreError::Codec)?;
        self.meta.put(META_SYNC_STATE, &bytes)?;
        Ok(())
    }

    /// Record an address in the watched list without touching the wire.
    /// Returns whether the address was new.
    pub fn track_address(&self, derived: &DerivedKey, chain: Chain) -> Result<bool, SyncError> {
        let (list, key) = match chain {
            Chain::External => (&self.watched_external, META_WATCHED_EXTERNAL),
            Chain::Internal => (&self.watched_internal, META_WATCHED_INTERNAL),
        };
        let added = {
            let mut watched = list.lock();
            if watched
                .iter()
                .any(|entry| entry.script_hash == derived.script_hash)
            {
                false
            } else {
                watched.push(WatchedAddress {
                    script_hash: derived.script_hash,
                    address: derived.address.clone(),
                    path: derived.path,
                });
                true
            }
        };
        if added {
            let bytes = {
                let watched = list.lock();
                bincode::serialize(&*watched).map_err(StoreError::Codec)?
            };
            self.meta.put(key, &bytes)?;
        }
        Ok(added)
    }

    /// Persist and subscribe a discovered address. Idempotent per script
    /// hash; the provider additionally guarantees a single wire
    /// subscription.
    pub async fn watch_address(
        &self,
        derived: &DerivedKey,
        chain: Chain,
    ) -> Result<(), SyncError> {
        self.track_address(derived, chain)?;
        self.provider.subscribe_to_address(&derived.script_hash).await?;
        Ok(())
    }

    /// Hand out the next internal-chain path. Indices are monotone; a
    /// path returned here is never returned again.
    pub fn next_internal_path(&self) -> Result<HdPath, SyncError> {
        let path = {
            let mut states = self.states.lock();
            let mut current = (*states).unwrap_or_else(|| self.fresh_states());
            let path = current.internal.path;
            current.internal.path = path.bump_index();
            *states = Some(current);
            path
        };
        self.persist_states()?;
        Ok(path)
    }

    fn owned_addresses(&self) -> HashMap<String, (HdPath, Chain)> {
        let mut owned = HashMap::new();
        for entry in self.watched_external.lock().iter() {
            owned.insert(entry.address.clone(), (entry.path, Chain::External));
        }
        for entry in self.watched_internal.lock().iter() {
            owned.insert(entry.address.clone(), (entry.path, Chain::Internal));
        }
        owned
    }

    /// Confirmation bucket for a transaction at `height` given the
    /// current tip and the confirmation threshold.
    pub fn classify(&self, height: u64) -> Bucket {
        if height == 0 {
            return Bucket::Mempool;
        }
        let tip = self.current_block();
        let confirmations = tip.saturating_sub(height) + 1;
        if confirmations >= self.min_confirmations {
            Bucket::Confirmed
        } else {
            Bucket::Pending
        }
    }

    /// Apply one transaction's deltas to the ledger and the UTXO set.
    ///
    /// Safe to call repeatedly for the same transaction: balance
    /// contributions dedupe by txid, and spent outpoints stay spent.
    pub fn apply_transaction(&self, view: &TransactionView) -> Result<(), SyncError> {
        let bucket = self.classify(view.height);
        let owned = self.owned_addresses();

        let mut ours_out = 0usize;
        for output in &view.outputs {
            let Some((path, _)) = owned.get(&output.address) else {
                continue;
            };
            ours_out += 1;
            self.ledger.update_entry(&output.address, |entry| {
                entry
                    .incoming
                    .add_txid(bucket, &view.txid, output.value);
            })?;
            self.upsert_utxo(view, output, *path)?;
        }

        let mut ours_in = 0usize;
        for input in &view.inputs {
            if !owned.contains_key(&input.address) {
                continue;
            }
            ours_in += 1;
            self.ledger.update_entry(&input.address, |entry| {
                entry.outgoing.add_txid(bucket, &view.txid, input.value);
            })?;
            self.spend_outpoint(&input.txid, input.index)?;
        }

        let wholly_ours = !view.inputs.is_empty()
            && ours_in == view.inputs.len()
            && ours_out == view.outputs.len();
        if wholly_ours && !view.fee.is_zero() {
            if let Some(address) = self.fee_address(view, &owned) {
                self.ledger.update_entry(&address, |entry| {
                    entry.fees.add_txid(bucket, &view.txid, view.fee);
                })?;
            }
        }

        self.ledger.store_tx(view)?;
        Ok(())
    }

    /// The address a wholly-ours transaction's fee is attributed to: the
    /// change (internal-chain) output when present, else the spender.
    fn fee_address(
        &self,
        view: &TransactionView,
        owned: &HashMap<String, (HdPath, Chain)>,
    ) -> Option<String> {
        view.outputs
            .iter()
            .find(|out| matches!(owned.get(&out.address), Some((_, Chain::Internal))))
            .map(|out| out.address.clone())
            .or_else(|| view.inputs.first().map(|input| input.address.clone()))
    }

    fn upsert_utxo(
        &self,
        view: &TransactionView,
        output: &crate::electrum::TxOutputView,
        path: HdPath,
    ) -> Result<(), SyncError> {
        if self
            .utxo_store
            .get(&spent_key(&view.txid, output.index))?
            .is_some()
        {
            return Ok(());
        }
        let derived = self.keys.derive(&path)?;
        let utxo = Utxo {
            txid: view.txid.clone(),
            index: output.index,
            value: output.value,
            script_hex: output.script_hex.clone(),
            address: output.address.clone(),
            path,
            public_key: derived.public_key,
            height: view.height,
        };
        let bytes = bincode::serialize(&utxo).map_err(StoreError::Codec)?;
        self.utxo_store
            .put(&utxo_key(&view.txid, output.index), &bytes)?;
        Ok(())
    }

    fn spend_outpoint(&self, txid: &str, index: u32) -> Result<(), SyncError> {
        self.utxo_store.delete(&utxo_key(txid, index))?;
        self.utxo_store.put(&spent_key(txid, index), &[1])?;
        Ok(())
    }

    /// All unspent outputs currently tracked.
    pub fn list_utxos(&self) -> Result<Vec<Utxo>, SyncError> {
        let range = RangeQuery::between(UTXO_PREFIX, UTXO_END);
        self.utxo_store
            .entries(&range)?
            .into_iter()
            .map(|(key, value)| {
                bincode::deserialize(&value).map_err(|err| {
                    SyncError::Store(StoreError::Corrupt(format!(
                        "utxo record {}: {err}",
                        String::from_utf8_lossy(&key)
                    )))
                })
            })
            .collect()
    }

    /// Select unlocked UTXOs covering `target` plus a dust margin.
    ///
    /// Candidates are confirmed outputs (mempool/pending join in only
    /// when the policy allows unconfirmed spends), walked in descending
    /// value then ascending height then outpoint, so selection is
    /// deterministic. Selected outpoints are locked until
    /// [`unlock_utxo`](Self::unlock_utxo).
    pub fn utxo_for_amount(&self, target: Amount) -> Result<UtxoSelection, SyncError> {
        let dust_margin = Amount::from_sats(crate::builder::DUST_LIMIT_SATS);
        let goal = target
            .checked_add(dust_margin)
            .ok_or(SyncError::InsufficientFunds {
                required: target,
                available: Amount::ZERO,
            })?;

        let locked = self.locked.lock().clone();
        let mut candidates: Vec<Utxo> = self
            .list_utxos()?
            .into_iter()
            .filter(|utxo| !locked.contains(&(utxo.txid.clone(), utxo.index)))
            .filter(|utxo| match self.classify(utxo.height) {
                Bucket::Confirmed => true,
                Bucket::Pending | Bucket::Mempool => self.allow_unconfirmed_spends,
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.height.cmp(&b.height))
                .then_with(|| a.txid.cmp(&b.txid))
                .then_with(|| a.index.cmp(&b.index))
        });

        let available: Amount = candidates.iter().map(|utxo| utxo.value).sum();
        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in candidates {
            total += utxo.value;
            selected.push(utxo);
            if total >= goal {
                break;
            }
        }
        if total < goal {
            return Err(SyncError::InsufficientFunds {
                required: goal,
                available,
            });
        }

        let mut locked = self.locked.lock();
        for utxo in &selected {
            locked.insert((utxo.txid.clone(), utxo.index));
        }
        Ok(UtxoSelection {
            utxos: selected,
            total,
        })
    }

    /// Release the builder's UTXO reservations. On success the spent
    /// outputs leave the available set for good; on failure they return
    /// to it.
    pub fn unlock_utxo(&self, success: bool) -> Result<(), SyncError> {
        let drained: Vec<(String, u32)> = self.locked.lock().drain().collect();
        if success {
            for (txid, index) in &drained {
                self.spend_outpoint(txid, *index)?;
            }
        }
        Ok(())
    }

    pub fn locked_count(&self) -> usize {
        self.locked.lock().len()
    }

    /// Accept a new chain tip.
    ///
    /// A height below the current tip is a reorg: it is logged and
    /// refused, and no state moves. Advancing the tip reclassifies
    /// ledger entries whose confirmation count just crossed the
    /// threshold.
    pub fn update_block(&self, height: u64) -> Result<(), SyncError> {
        let current = self.current_block();
        if height < current {
            warn!(current, announced = height, "reorg detected; refusing block update");
            return Err(SyncError::ReorgDetected {
                current,
                announced: height,
            });
        }
        if height == current {
            return Ok(());
        }
        self.current_block.store(height, Ordering::SeqCst);
        let bytes = bincode::serialize(&height).map_err(StoreError::Codec)?;
        self.meta.put(META_LATEST_BLOCK, &bytes)?;
        debug!(height, "chain tip advanced");

        // Entries confirmed in (old_boundary, new_boundary] just crossed
        // the confirmation threshold; re-applying reclassifies them.
        let old_boundary = (current + 1).saturating_sub(self.min_confirmations);
        let new_boundary = (height + 1).saturating_sub(self.min_confirmations);
        if new_boundary > old_boundary {
            for view in self.ledger.get_tx_between(old_boundary, new_boundary)? {
                self.apply_transaction(&view)?;
            }
        }
        Ok(())
    }

    /// React to a script-hash status push: refetch that address's
    /// history and fold it into the ledger.
    pub async fn handle_script_notification(&self, script_hash_hex: &str) -> Result<(), SyncError> {
        let watched = {
            let find = |list: &Mutex<Vec<WatchedAddress>>| {
                list.lock()
                    .iter()
                    .find(|entry| entry.script_hash.to_hex() == script_hash_hex)
                    .cloned()
            };
            find(&self.watched_external).or_else(|| find(&self.watched_internal))
        };
        let Some(watched) = watched else {
            debug!(script_hash = script_hash_hex, "push for unwatched script hash");
            return Ok(());
        };
        let views = self.fetch_address_views(&watched.script_hash).await?;
        for view in &views {
            self.apply_transaction(view)?;
        }
        self.recompute_balances()?;
        Ok(())
    }

    /// Consume wallet events, folding block and script pushes back into
    /// the ledger.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut events = sync.events_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WalletEvent::NewBlock { height }) => {
                        if let Err(err) = sync.update_block(height) {
                            warn!(error = %err, "block update refused");
                        }
                    }
                    Ok(WalletEvent::NewTx { script_hash, .. }) => {
                        if let Err(err) = sync.handle_script_notification(&script_hash).await {
                            warn!(error = %err, "failed to process script notification");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync event loop lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Recompute and persist the external-chain and total balances.
    pub fn recompute_balances(&self) -> Result<(BalanceSummary, BalanceSummary), SyncError> {
        let owned = self.owned_addresses();
        let mut receive = BalanceSummary::default();
        let mut total = BalanceSummary::default();
        for address in self.ledger.addresses()? {
            let Some(entry) = self.ledger.get_entry(&address)? else {
                continue;
            };
            let net = entry.net();
            total = add_summary(total, net);
            if matches!(owned.get(&address), Some((_, Chain::External))) {
                receive = add_summary(receive, net);
            }
        }
        self.meta.put(
            META_RECEIVE_BALANCE,
            &bincode::serialize(&receive).map_err(StoreError::Codec)?,
        )?;
        self.meta.put(
            META_TOTAL_BALANCE,
            &bincode::serialize(&total).map_err(StoreError::Codec)?,
        )?;
        Ok((receive, total))
    }

    /// Net balance over every address the wallet owns.
    pub fn total_balance(&self) -> Result<BalanceSummary, SyncError> {
        let mut total = BalanceSummary::default();
        for address in self.ledger.addresses()? {
            if let Some(entry) = self.ledger.get_entry(&address)? {
                total = add_summary(total, entry.net());
            }
        }
        Ok(total)
    }

    pub fn ledger(&self) -> &Arc<AddressLedger> {
        &self.ledger
    }

    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub fn keys(&self) -> &Arc<dyn KeyManager> {
        &self.keys
    }
}

fn add_summary(a: BalanceSummary, b: BalanceSummary) -> BalanceSummary {
    BalanceSummary {
        confirmed: a.confirmed + b.confirmed,
        pending: a.pending + b.pending,
        mempool: a.mempool + b.mempool,
        consolidated: a.consolidated + b.consolidated,
    }
}

fn utxo_key(txid: &str, index: u32) -> Vec<u8> {
    format!("{UTXO_PREFIX}{txid}:{index:08}").into_bytes()
}

fn spent_key(txid: &str, index: u32) -> Vec<u8> {
    format!("{SPENT_PREFIX}{txid}:{index:08}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::PolicyConfig;
    use crate::electrum::{Connection, TxCache, TxOutputView};
    use crate::events;
    use crate::keys::{Network, SeedKeyManager};
    use crate::store::MemoryStore;

    fn harness(min_confirmations: u64) -> Arc<SyncManager> {
        let (events_tx, _events_rx) = events::channel();
        let connection = Connection::new(
            "127.0.0.1",
            1,
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let cache = Arc::new(
            TxCache::new(Arc::new(MemoryStore::new()), 100, Duration::from_secs(300))
                .expect("cache"),
        );
        let provider = Arc::new(crate::electrum::Provider::new(
            connection,
            cache,
            events_tx.clone(),
        ));
        let keys: Arc<dyn KeyManager> = Arc::new(SeedKeyManager::new([3u8; 32], Network::Regtest));
        let ledger = Arc::new(AddressLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        ));
        let policy = PolicyConfig {
            min_confirmations,
            gap_limit: 3,
            ..PolicyConfig::default()
        };
        let base_path = HdPath::new(84, 1, 0, Chain::External, 0);
        let sync = Arc::new(SyncManager::new(
            provider,
            keys,
            ledger,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            &policy,
            base_path,
            events_tx,
        ));
        sync.init().expect("init");
        sync
    }

    fn owned_key(sync: &SyncManager, chain: Chain, index: u32) -> DerivedKey {
        let path = HdPath::new(84, 1, 0, chain, index);
        let derived = sync.keys().derive(&path).expect("derive");
        sync.track_address(&derived, chain).expect("track");
        derived
    }

    fn payment_view(txid: &str, height: u64, address: &str, value: u64) -> TransactionView {
        TransactionView {
            txid: txid.to_string(),
            height,
            outputs: vec![TxOutputView {
                address: address.to_string(),
                value: Amount::from_sats(value),
                script_hex: "0014aa".to_string(),
                index: 0,
                txid: txid.to_string(),
                height,
            }],
            inputs: Vec::new(),
            fee: Amount::ZERO,
            std_out: vec![true],
            std_in: Vec::new(),
            unconfirmed_inputs: Vec::new(),
            coinbase: false,
        }
    }

    #[tokio::test]
    async fn classification_follows_confirmation_thresholds() {
        let sync = harness(3);
        sync.update_block(100).expect("tip");
        assert_eq!(sync.classify(0), Bucket::Mempool);
        assert_eq!(sync.classify(100), Bucket::Pending);
        assert_eq!(sync.classify(99), Bucket::Pending);
        assert_eq!(sync.classify(98), Bucket::Confirmed);
        assert_eq!(sync.classify(50), Bucket::Confirmed);
    }

    #[tokio::test]
    async fn apply_transaction_is_idempotent() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);
        let view = payment_view("aa", 90, &key.address, 10_000);

        sync.apply_transaction(&view).expect("first apply");
        sync.apply_transaction(&view).expect("second apply");

        let entry = sync
            .ledger()
            .get_entry(&key.address)
            .expect("entry")
            .expect("present");
        assert_eq!(entry.incoming.confirmed.to_sats(), 10_000);
        assert_eq!(sync.list_utxos().expect("utxos").len(), 1);
    }

    #[tokio::test]
    async fn bucket_move_preserves_net_balance() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);

        sync.apply_transaction(&payment_view("aa", 0, &key.address, 7_000))
            .expect("mempool apply");
        let entry = sync.ledger().get_entry(&key.address).expect("e").expect("p");
        assert_eq!(entry.incoming.mempool.to_sats(), 7_000);
        let before = entry.net().consolidated;

        sync.apply_transaction(&payment_view("aa", 99, &key.address, 7_000))
            .expect("confirmed apply");
        let entry = sync.ledger().get_entry(&key.address).expect("e").expect("p");
        assert_eq!(entry.incoming.mempool.to_sats(), 0);
        assert_eq!(entry.incoming.confirmed.to_sats(), 7_000);
        assert_eq!(entry.net().consolidated, before);

        // The history index moved with it.
        assert_eq!(sync.ledger().tx_height("aa").expect("height"), Some(99));
        assert!(sync.ledger().get_tx_height(0).expect("scan").is_empty());
    }

    #[tokio::test]
    async fn spent_outputs_do_not_resurrect() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);
        let funding = payment_view("aa", 90, &key.address, 10_000);
        sync.apply_transaction(&funding).expect("funding");
        assert_eq!(sync.list_utxos().expect("utxos").len(), 1);

        let spend = TransactionView {
            txid: "bb".to_string(),
            height: 95,
            outputs: Vec::new(),
            inputs: vec![TxOutputView {
                address: key.address.clone(),
                value: Amount::from_sats(10_000),
                script_hex: "0014aa".to_string(),
                index: 0,
                txid: "aa".to_string(),
                height: 90,
            }],
            fee: Amount::ZERO,
            std_out: Vec::new(),
            std_in: vec![true],
            unconfirmed_inputs: Vec::new(),
            coinbase: false,
        };
        sync.apply_transaction(&spend).expect("spend");
        assert!(sync.list_utxos().expect("utxos").is_empty());

        // Replaying the funding transaction must not bring it back.
        sync.apply_transaction(&funding).expect("replay");
        assert!(sync.list_utxos().expect("utxos").is_empty());
    }

    #[tokio::test]
    async fn wholly_ours_fee_lands_on_change_address() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let source = owned_key(&sync, Chain::External, 0);
        let change = owned_key(&sync, Chain::Internal, 0);

        let view = TransactionView {
            txid: "cc".to_string(),
            height: 99,
            outputs: vec![TxOutputView {
                address: change.address.clone(),
                value: Amount::from_sats(9_500),
                script_hex: "0014bb".to_string(),
                index: 0,
                txid: "cc".to_string(),
                height: 99,
            }],
            inputs: vec![TxOutputView {
                address: source.address.clone(),
                value: Amount::from_sats(10_000),
                script_hex: "0014aa".to_string(),
                index: 0,
                txid: "aa".to_string(),
                height: 90,
            }],
            fee: Amount::from_sats(500),
            std_out: vec![true],
            std_in: vec![true],
            unconfirmed_inputs: Vec::new(),
            coinbase: false,
        };
        sync.apply_transaction(&view).expect("apply");

        let entry = sync
            .ledger()
            .get_entry(&change.address)
            .expect("entry")
            .expect("present");
        assert_eq!(entry.fees.confirmed.to_sats(), 500);
    }

    #[tokio::test]
    async fn coin_selection_locks_and_reports_insufficiency() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);
        sync.apply_transaction(&payment_view("aa", 90, &key.address, 10_000))
            .expect("apply");
        sync.apply_transaction(&payment_view("bb", 91, &key.address, 6_000))
            .expect("apply");
        sync.apply_transaction(&payment_view("cc", 0, &key.address, 50_000))
            .expect("apply mempool");

        // Mempool output is not a candidate under the default policy,
        // so the largest confirmed output covers this.
        let selection = sync
            .utxo_for_amount(Amount::from_sats(8_000))
            .expect("select");
        assert_eq!(selection.utxos.len(), 1);
        assert_eq!(selection.total.to_sats(), 10_000);
        assert_eq!(sync.locked_count(), 1);

        // With the large output locked, the rest cannot cover it.
        let err = sync
            .utxo_for_amount(Amount::from_sats(8_000))
            .expect_err("insufficient");
        match err {
            SyncError::InsufficientFunds { available, .. } => {
                assert_eq!(available.to_sats(), 6_000)
            }
            other => panic!("expected insufficiency, got {other:?}"),
        }

        // Releasing without success returns the output to the pool.
        sync.unlock_utxo(false).expect("unlock");
        assert_eq!(sync.locked_count(), 0);
        sync.utxo_for_amount(Amount::from_sats(8_000)).expect("again");

        // Releasing with success consumes it.
        sync.unlock_utxo(true).expect("unlock spent");
        let remaining = sync.list_utxos().expect("utxos");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|utxo| utxo.txid != "aa"));
    }

    #[tokio::test]
    async fn selection_order_is_deterministic() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);
        sync.apply_transaction(&payment_view("aa", 95, &key.address, 4_000))
            .expect("apply");
        sync.apply_transaction(&payment_view("bb", 90, &key.address, 4_000))
            .expect("apply");
        sync.apply_transaction(&payment_view("cc", 92, &key.address, 9_000))
            .expect("apply");

        let selection = sync
            .utxo_for_amount(Amount::from_sats(10_000))
            .expect("select");
        let order: Vec<&str> = selection.utxos.iter().map(|u| u.txid.as_str()).collect();
        // Largest value first, then older (lower height) among equals.
        assert_eq!(order, vec!["cc", "bb"]);
    }

    #[tokio::test]
    async fn reorg_is_refused_and_state_unchanged() {
        let sync = harness(1);
        sync.update_block(100).expect("tip");
        let err = sync.update_block(99).expect_err("reorg");
        assert!(matches!(
            err,
            SyncError::ReorgDetected {
                current: 100,
                announced: 99
            }
        ));
        assert_eq!(sync.current_block(), 100);
        sync.update_block(101).expect("advance");
        assert_eq!(sync.current_block(), 101);
    }

    #[tokio::test]
    async fn advancing_tip_reclassifies_pending_entries() {
        let sync = harness(3);
        sync.update_block(100).expect("tip");
        let key = owned_key(&sync, Chain::External, 0);

        // Confirmed at 99 with tip 100: 2 confirmations, still pending.
        sync.apply_transaction(&payment_view("aa", 99, &key.address, 5_000))
            .expect("apply");
        let entry = sync.ledger().get_entry(&key.address).expect("e").expect("p");
        assert_eq!(entry.incoming.pending.to_sats(), 5_000);

        sync.update_block(101).expect("advance");
        let entry = sync.ledger().get_entry(&key.address).expect("e").expect("p");
        assert_eq!(entry.incoming.pending.to_sats(), 0);
        assert_eq!(entry.incoming.confirmed.to_sats(), 5_000);
    }

    #[tokio::test]
    async fn internal_paths_are_handed_out_monotonically() {
        let sync = harness(1);
        let first = sync.next_internal_path().expect("path");
        let second = sync.next_internal_path().expect("path");
        assert_eq!(first.chain, Chain::Internal);
        assert_eq!(second.index, first.index + 1);
    }
}

