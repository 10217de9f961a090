use tokio::sync::broadcast;

use crate::electrum::ConnectionStatus;
use crate::keys::Chain;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast channel the wallet components publish their events on.
pub fn channel() -> (broadcast::Sender<WalletEvent>, broadcast::Receiver<WalletEvent>) {
    broadcast::channel(CHANNEL_CAPACITY)
}

/// Observable wallet happenings, fanned out over a broadcast channel.
#[derive(Clone, Debug)]
pub enum WalletEvent {
    /// Wallet finished initialisation and is serving requests.
    Ready,
    /// A new chain tip was announced.
    NewBlock { height: u64 },
    /// A watched script hash changed status.
    NewTx {
        script_hash: String,
        status: Option<String>,
    },
    /// A scan finished processing one address.
    SyncedPath { chain: Chain, path: String },
    /// A scan cycle completed or was stopped.
    SyncEnd,
    /// The transport changed state.
    Status {
        prev: ConnectionStatus,
        new: ConnectionStatus,
    },
    /// A frame could not be decoded or matched; informational only.
    RequestError { detail: String },
}
