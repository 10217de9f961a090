//! Wire-level request and response shapes for the Electrum protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing JSON-RPC request, one line on the wire.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Error object attached to a failed JSON-RPC reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Raw incoming frame before demultiplexing. Field presence, not shape,
/// decides how the frame is routed.
#[derive(Debug, Deserialize)]
pub struct RawFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// A demultiplexed frame.
#[derive(Debug)]
pub enum Frame {
    /// Server-initiated subscription push, routed by method name.
    Push { method: String, params: Value },
    /// Reply to an in-flight request, routed by id.
    Reply {
        id: u64,
        result: Result<Value, RpcErrorObject>,
    },
}

impl Frame {
    /// Classify a raw frame. A `method` ending in `.subscribe` marks a
    /// push regardless of any other field; otherwise the `id` selects the
    /// pending request. A success reply's absent `result` is `null`.
    pub fn classify(raw: RawFrame) -> Result<Frame, UnroutableFrame> {
        if let Some(method) = &raw.method {
            if method.ends_with(".subscribe") {
                return Ok(Frame::Push {
                    method: method.clone(),
                    params: raw.params.unwrap_or(Value::Null),
                });
            }
        }
        match raw.id {
            Some(id) => {
                let result = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Frame::Reply { id, result })
            }
            None => Err(UnroutableFrame),
        }
    }
}

/// Frame carrying neither a subscription method nor an id.
#[derive(Debug)]
pub struct UnroutableFrame;

/// Result of `blockchain.headers.subscribe` and payload of its pushes.
#[derive(Clone, Debug, Deserialize)]
pub struct HeaderNotification {
    #[serde(alias = "block_height")]
    pub height: u64,
    #[serde(default)]
    pub hex: Option<String>,
}

/// One entry of `blockchain.scripthash.get_history` / `get_mempool`.
///
/// `height > 0` is the confirmation height, `0` is mempool, negative
/// means mempool with unconfirmed parents.
#[derive(Clone, Debug, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

/// Result of `blockchain.scripthash.get_balance`.
#[derive(Clone, Debug, Deserialize)]
pub struct BalanceResult {
    pub confirmed: u64,
    pub unconfirmed: i64,
}

/// Verbose transaction as returned by `blockchain.transaction.get` with
/// `verbose = true` (bitcoind decoding).
#[derive(Clone, Debug, Deserialize)]
pub struct VerboseTransaction {
    pub txid: String,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub confirmations: Option<u64>,
    pub vin: Vec<VerboseVin>,
    pub vout: Vec<VerboseVout>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerboseVin {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerboseVout {
    /// Main-unit value as emitted by bitcoind; converted to satoshis at
    /// this boundary only.
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: VerboseScript,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerboseScript {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    pub hex: String,
    #[serde(default, rename = "type")]
    pub script_type: Option<String>,
}

impl VerboseScript {
    /// The script's address when one is extractable; `None` for
    /// non-standard scripts, OP_RETURN and bare multisig.
    pub fn resolved_address(&self) -> Option<&str> {
        if let Some(address) = &self.address {
            return Some(address);
        }
        self.addresses.as_ref().and_then(|list| match list.len() {
            1 => Some(list[0].as_str()),
            _ => None,
        })
    }
}
