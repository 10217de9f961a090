//! Key-manager seam and derivation paths.
//!
//! Real BIP32/BIP39 derivation, signing and network address encoding live
//! outside this crate; the wallet reaches them through [`KeyManager`].
//! [`SeedKeyManager`] is the deterministic development implementation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::amount::Amount;

pub mod path;
pub mod seed;

pub use path::{AddressType, Chain, HdPath, PathError};
pub use seed::SeedKeyManager;

/// 32-byte digest of an output script; the Electrum subscription key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptHash(pub [u8; 32]);

impl ScriptHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(text).map_err(|_| KeyError::MalformedScriptHash)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::MalformedScriptHash)?;
        Ok(ScriptHash(arr))
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self.to_hex())
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Network the key manager encodes addresses for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = KeyError;

    fn from_str(name: &str) -> Result<Self, KeyError> {
        match name {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(KeyError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        write!(f, "{name}")
    }
}

/// Key material derived for one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKey {
    pub path: HdPath,
    pub script_hash: ScriptHash,
    pub address: String,
    pub public_key: Vec<u8>,
}

/// One input the signer must witness: the previous output being spent
/// plus the derivation that controls it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInput {
    pub txid: String,
    pub index: u32,
    pub value: Amount,
    pub script_hex: String,
    pub path: HdPath,
    pub public_key: Vec<u8>,
}

/// One output of the transaction under construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningOutput {
    pub address: String,
    pub value: Amount,
}

/// Inputs, derivations and outputs handed to the signer; the PSBT-level
/// assembly happens behind the [`KeyManager`] seam.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub inputs: Vec<SigningInput>,
    pub outputs: Vec<SigningOutput>,
}

/// Finalized transaction returned by the signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    pub txid: String,
    pub hex: String,
    /// Virtual size in vbytes of the finalized transaction.
    pub vsize: u64,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),
    #[error("malformed script hash")]
    MalformedScriptHash,
    #[error("derivation failed: {0}")]
    Derivation(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// External key-derivation and signing capability.
pub trait KeyManager: Send + Sync {
    fn network(&self) -> Network;
    /// Root key fingerprint, hex-encoded.
    fn fingerprint(&self) -> String;
    /// Derive the script hash, encoded address and public key for `path`.
    fn derive(&self, path: &HdPath) -> Result<DerivedKey, KeyError>;
    /// Assemble, sign and finalize the requested transaction.
    fn sign(&self, request: &SigningRequest) -> Result<SignedTransaction, KeyError>;
}
