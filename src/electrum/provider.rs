//! Typed facade over the Electrum transport.
//!
//! Assembles rich transaction views with inputs resolved to the previous
//! outputs they spend, owns the transaction cache, and replays
//! subscriptions after a reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::TxCache;
use super::messages::{BalanceResult, HeaderNotification, HistoryItem, VerboseTransaction};
use super::transport::{Connection, ConnectionStatus, TransportError, TransportEvent};
use super::{TransactionView, TxOutputView};
use crate::amount::Amount;
use crate::events::WalletEvent;
use crate::keys::ScriptHash;
use crate::store::StoreError;

const CLIENT_NAME: &str = "filament-wallet";
const PROTOCOL_VERSION: &str = "1.4";

/// Initial coin subsidy in satoshis.
const INITIAL_SUBSIDY: u64 = 5_000_000_000;
/// Blocks between subsidy halvings.
const HALVING_INTERVAL: u64 = 210_000;

/// The block subsidy at `height` under the halving schedule.
pub fn block_subsidy(height: u64) -> Amount {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return Amount::ZERO;
    }
    Amount::from_sats(INITIAL_SUBSIDY >> halvings)
}

/// Per-call options for [`Provider::get_transaction`].
#[derive(Clone, Copy, Debug)]
pub struct TxOptions {
    /// Serve from the cache when a reusable (confirmed) view exists.
    pub use_cache: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected payload for `{method}`: {detail}")]
    Payload { method: String, detail: String },
    #[error(transparent)]
    Cache(#[from] StoreError),
}

fn payload_err(method: &str, err: impl ToString) -> ProviderError {
    ProviderError::Payload {
        method: method.to_string(),
        detail: err.to_string(),
    }
}

/// Higher-level Electrum client.
pub struct Provider {
    connection: Connection,
    cache: Arc<TxCache>,
    tip_height: AtomicU64,
    blocks_subscribed: AtomicBool,
    subscribed: Mutex<HashSet<String>>,
    events_tx: broadcast::Sender<WalletEvent>,
}

impl Provider {
    /// Build a provider publishing on the shared wallet event channel.
    pub fn new(
        connection: Connection,
        cache: Arc<TxCache>,
        events_tx: broadcast::Sender<WalletEvent>,
    ) -> Self {
        Self {
            connection,
            cache,
            tip_height: AtomicU64::new(0),
            blocks_subscribed: AtomicBool::new(false),
            subscribed: Mutex::new(HashSet::new()),
            events_tx,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn cache(&self) -> &Arc<TxCache> {
        &self.cache
    }

    /// Height of the most recently announced chain tip.
    pub fn tip_height(&self) -> u64 {
        self.tip_height.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events_tx.subscribe()
    }

    /// Forward transport notifications and status changes as typed
    /// wallet events until the connection goes away.
    pub fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        let mut events = provider.connection.events();
        let mut status = provider.connection.status_changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(TransportEvent::Notification { method, params }) => {
                            provider.route_notification(&method, params);
                        }
                        Ok(TransportEvent::RequestError { detail }) => {
                            provider.emit(WalletEvent::RequestError { detail });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "event pump lagged behind the transport");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = status.changed() => match changed {
                        Ok(()) => {
                            let change = *status.borrow_and_update();
                            provider.emit(WalletEvent::Status {
                                prev: change.prev,
                                new: change.new,
                            });
                            // A session that just came back up has lost
                            // its server-side subscriptions.
                            if change.new == ConnectionStatus::Connected
                                && change.prev == ConnectionStatus::Connecting
                            {
                                if let Err(err) = provider.resubscribe_all().await {
                                    warn!(error = %err, "resubscription after reconnect failed");
                                }
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
        })
    }

    fn emit(&self, event: WalletEvent) {
        let _ = self.events_tx.send(event);
    }

    fn route_notification(&self, method: &str, params: Value) {
        match method {
            "blockchain.headers.subscribe" => {
                let header: Result<(HeaderNotification,), _> = serde_json::from_value(params);
                match header {
                    Ok((header,)) => {
                        self.tip_height.store(header.height, Ordering::SeqCst);
                        self.emit(WalletEvent::NewBlock {
                            height: header.height,
                        });
                    }
                    Err(err) => warn!(error = %err, "malformed header notification"),
                }
            }
            "blockchain.scripthash.subscribe" => {
                let push: Result<(String, Option<String>), _> = serde_json::from_value(params);
                match push {
                    Ok((script_hash, status)) => {
                        self.emit(WalletEvent::NewTx {
                            script_hash,
                            status,
                        });
                    }
                    Err(err) => warn!(error = %err, "malformed scripthash notification"),
                }
            }
            other => debug!(method = other, "ignoring unhandled subscription push"),
        }
    }

    /// Negotiate the protocol version with the server.
    pub async fn server_version(&self) -> Result<(String, String), ProviderError> {
        let result = self
            .connection
            .call("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))
            .await?;
        serde_json::from_value(result).map_err(|err| payload_err("server.version", err))
    }

    /// Keepalive round trip.
    pub async fn ping(&self) -> Result<(), ProviderError> {
        self.connection.call("server.ping", json!([])).await?;
        Ok(())
    }

    /// Subscribe to chain tip announcements; returns the current height.
    pub async fn subscribe_to_blocks(&self) -> Result<u64, ProviderError> {
        let result = self
            .connection
            .call("blockchain.headers.subscribe", json!([]))
            .await?;
        let header: HeaderNotification = serde_json::from_value(result)
            .map_err(|err| payload_err("blockchain.headers.subscribe", err))?;
        self.tip_height.store(header.height, Ordering::SeqCst);
        self.blocks_subscribed.store(true, Ordering::SeqCst);
        self.emit(WalletEvent::NewBlock {
            height: header.height,
        });
        Ok(header.height)
    }

    /// Subscribe to a script hash. Each script hash is subscribed at most
    /// once; repeats return the known state without touching the wire.
    pub async fn subscribe_to_address(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<Option<String>, ProviderError> {
        let hex = script_hash.to_hex();
        if !self.subscribed.lock().insert(hex.clone()) {
            return Ok(None);
        }
        let result = self
            .connection
            .call("blockchain.scripthash.subscribe", json!([hex]))
            .await;
        match result {
            Ok(value) => serde_json::from_value(value)
                .map_err(|err| payload_err("blockchain.scripthash.subscribe", err)),
            Err(err) => {
                self.subscribed.lock().remove(&hex);
                Err(err.into())
            }
        }
    }

    /// Replay every registered subscription; used after `reconnect()`.
    pub async fn resubscribe_all(&self) -> Result<(), ProviderError> {
        if self.blocks_subscribed.load(Ordering::SeqCst) {
            self.subscribe_to_blocks().await?;
        }
        let script_hashes: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        for hex in script_hashes {
            self.connection
                .call("blockchain.scripthash.subscribe", json!([hex]))
                .await?;
        }
        info!("replayed subscriptions after reconnect");
        Ok(())
    }

    /// Confirmed history of a script hash, each entry expanded to a view.
    pub async fn get_address_history(
        &self,
        script_hash: &ScriptHash,
        opts: TxOptions,
    ) -> Result<Vec<TransactionView>, ProviderError> {
        let items = self
            .history_items("blockchain.scripthash.get_history", script_hash)
            .await?;
        try_join_all(
            items
                .iter()
                .map(|item| self.get_transaction(&item.tx_hash, opts)),
        )
        .await
    }

    /// Mempool entries touching a script hash, expanded to views.
    pub async fn get_mempool_tx(
        &self,
        script_hash: &ScriptHash,
        opts: TxOptions,
    ) -> Result<Vec<TransactionView>, ProviderError> {
        let items = self
            .history_items("blockchain.scripthash.get_mempool", script_hash)
            .await?;
        try_join_all(
            items
                .iter()
                .map(|item| self.get_transaction(&item.tx_hash, opts)),
        )
        .await
    }

    async fn history_items(
        &self,
        method: &str,
        script_hash: &ScriptHash,
    ) -> Result<Vec<HistoryItem>, ProviderError> {
        let result = self
            .connection
            .call(method, json!([script_hash.to_hex()]))
            .await?;
        serde_json::from_value(result).map_err(|err| payload_err(method, err))
    }

    /// Whether a script hash has any confirmed or mempool history.
    pub async fn has_history(&self, script_hash: &ScriptHash) -> Result<bool, ProviderError> {
        let confirmed = self
            .history_items("blockchain.scripthash.get_history", script_hash)
            .await?;
        if !confirmed.is_empty() {
            return Ok(true);
        }
        let mempool = self
            .history_items("blockchain.scripthash.get_mempool", script_hash)
            .await?;
        Ok(!mempool.is_empty())
    }

    /// Confirmed/unconfirmed balance of a script hash.
    pub async fn get_balance(
        &self,
        script_hash: &ScriptHash,
    ) -> Result<BalanceResult, ProviderError> {
        let result = self
            .connection
            .call(
                "blockchain.scripthash.get_balance",
                json!([script_hash.to_hex()]),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|err| payload_err("blockchain.scripthash.get_balance", err))
    }

    /// Balance of an encoded address, for servers indexing by address.
    pub async fn get_address_balance(
        &self,
        address: &str,
    ) -> Result<BalanceResult, ProviderError> {
        let result = self
            .connection
            .call("blockchain.address.get_balance", json!([address]))
            .await?;
        serde_json::from_value(result)
            .map_err(|err| payload_err("blockchain.address.get_balance", err))
    }

    /// Submit a raw transaction; returns the txid reported by the server.
    pub async fn broadcast_transaction(&self, hex: &str) -> Result<String, ProviderError> {
        let result = self
            .connection
            .call("blockchain.transaction.broadcast", json!([hex]))
            .await?;
        serde_json::from_value(result)
            .map_err(|err| payload_err("blockchain.transaction.broadcast", err))
    }

    /// Expand `txid` into a [`TransactionView`].
    ///
    /// Cached views are reused only when confirmed: a mempool view may
    /// confirm at any moment, so `height = 0` always refetches.
    pub async fn get_transaction(
        &self,
        txid: &str,
        opts: TxOptions,
    ) -> Result<TransactionView, ProviderError> {
        self.fetch_tx(txid, opts.use_cache).await
    }

    fn fetch_tx<'a>(
        &'a self,
        txid: &'a str,
        use_cache: bool,
    ) -> BoxFuture<'a, Result<TransactionView, ProviderError>> {
        Box::pin(async move {
            if use_cache {
                if let Some(view) = self.cache.get(txid)? {
                    if !view.is_mempool() {
                        return Ok(view);
                    }
                }
            }

            let raw = self
                .connection
                .call("blockchain.transaction.get", json!([txid, true]))
                .await?;
            let verbose: VerboseTransaction = serde_json::from_value(raw)
                .map_err(|err| payload_err("blockchain.transaction.get", err))?;

            let height = match verbose.confirmations.unwrap_or(0) {
                0 => 0,
                confirmations => self.tip_height().saturating_sub(confirmations - 1),
            };

            let mut outputs = Vec::new();
            let mut std_out = Vec::new();
            for vout in &verbose.vout {
                match vout.script_pub_key.resolved_address() {
                    Some(address) => {
                        std_out.push(true);
                        outputs.push(TxOutputView {
                            address: address.to_string(),
                            value: Amount::from_main_f64(vout.value),
                            script_hex: vout.script_pub_key.hex.clone(),
                            index: vout.n,
                            txid: verbose.txid.clone(),
                            height,
                        });
                    }
                    None => std_out.push(false),
                }
            }

            let mut inputs = Vec::new();
            let mut std_in = Vec::new();
            let mut unconfirmed_inputs = Vec::new();
            let mut coinbase = false;
            for vin in &verbose.vin {
                if vin.coinbase.is_some() {
                    coinbase = true;
                    std_in.push(true);
                    inputs.push(TxOutputView {
                        address: String::new(),
                        value: block_subsidy(height.saturating_sub(1)),
                        script_hex: String::new(),
                        index: 0,
                        txid: String::new(),
                        height,
                    });
                    continue;
                }
                let (Some(prev_txid), Some(prev_index)) = (&vin.txid, vin.vout) else {
                    std_in.push(false);
                    continue;
                };
                let prev = self.fetch_tx(prev_txid, true).await?;
                match prev.outputs.iter().find(|out| out.index == prev_index) {
                    Some(prev_out) => {
                        std_in.push(true);
                        if prev.is_mempool() {
                            unconfirmed_inputs.push(prev_txid.clone());
                        }
                        inputs.push(prev_out.clone());
                    }
                    None => std_in.push(false),
                }
            }

            let total_in: Amount = inputs.iter().map(|input| input.value).sum();
            let total_out: Amount = outputs.iter().map(|output| output.value).sum();
            let fee = if coinbase || total_in.is_zero() {
                Amount::ZERO
            } else {
                total_in.saturating_sub(total_out)
            };

            let view = TransactionView {
                txid: verbose.txid,
                height,
                outputs,
                inputs,
                fee,
                std_out,
                std_in,
                unconfirmed_inputs,
                coinbase,
            };
            self.cache.set(&view, None)?;
            Ok(view)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_follows_halving_schedule() {
        assert_eq!(block_subsidy(0).to_sats(), 5_000_000_000);
        assert_eq!(block_subsidy(209_999).to_sats(), 5_000_000_000);
        assert_eq!(block_subsidy(210_000).to_sats(), 2_500_000_000);
        assert_eq!(block_subsidy(630_000).to_sats(), 625_000_000);
        assert_eq!(block_subsidy(64 * 210_000).to_sats(), 0);
    }

    #[test]
    fn tx_options_default_to_cached_reads() {
        assert!(TxOptions::default().use_cache);
    }
}
