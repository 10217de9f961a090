//! Electrum client stack: newline-delimited JSON-RPC transport, the
//! transaction request cache, and the typed provider facade.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

pub mod cache;
pub mod messages;
pub mod provider;
pub mod transport;

pub use cache::TxCache;
pub use provider::{Provider, TxOptions};
pub use transport::{Connection, ConnectionStatus, StatusChange, TransportError, TransportEvent};

/// One output slot of an expanded transaction.
///
/// The same shape describes a transaction's own outputs and its inputs
/// once resolved to the previous outputs they spend; for inputs, `txid`,
/// `index` and `height` refer to the funding transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputView {
    pub address: String,
    pub value: Amount,
    pub script_hex: String,
    pub index: u32,
    pub txid: String,
    pub height: u64,
}

/// Normalised view of a raw transaction with inputs resolved to the
/// outputs they spend. `height = 0` means the transaction is in the
/// mempool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    pub txid: String,
    pub height: u64,
    pub outputs: Vec<TxOutputView>,
    pub inputs: Vec<TxOutputView>,
    pub fee: Amount,
    /// Per-vout flag: could the output script be resolved to an address.
    pub std_out: Vec<bool>,
    /// Per-vin flag: could the input be resolved to a previous output.
    pub std_in: Vec<bool>,
    /// Txids of mempool parents feeding this transaction.
    pub unconfirmed_inputs: Vec<String>,
    pub coinbase: bool,
}

impl TransactionView {
    pub fn total_in(&self) -> Amount {
        self.inputs.iter().map(|input| input.value).sum()
    }

    pub fn total_out(&self) -> Amount {
        self.outputs.iter().map(|output| output.value).sum()
    }

    pub fn is_mempool(&self) -> bool {
        self.height == 0
    }
}
