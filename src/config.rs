use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::Network;

const DEFAULT_ELECTRUM_HOST: &str = "127.0.0.1";
const DEFAULT_ELECTRUM_PORT: u16 = 50001;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_GAP_LIMIT: u32 = 20;
const DEFAULT_MIN_CONFIRMATIONS: u64 = 1;
const DEFAULT_PURPOSE: u32 = 84;
const DEFAULT_ACCOUNT: u32 = 0;
const DEFAULT_MAX_FEE_RATE: u64 = 100_000;
const DEFAULT_DUST_LIMIT: u64 = 546;

/// Top-level wallet configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalletConfig {
    pub electrum: ElectrumConfig,
    pub cache: CacheConfig,
    pub policy: PolicyConfig,
    pub fees: FeeConfig,
    pub store: StoreConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            electrum: ElectrumConfig::default(),
            cache: CacheConfig::default(),
            policy: PolicyConfig::default(),
            fees: FeeConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl WalletConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Electrum server endpoint and transport tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ElectrumConfig {
    pub host: String,
    pub port: u16,
    /// Network the key manager encodes addresses for.
    pub network: Network,
    /// Seconds allowed for the TCP session to come up.
    pub connect_timeout_secs: u64,
    /// Seconds a single RPC call may stay in flight.
    pub request_timeout_secs: u64,
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ELECTRUM_HOST.to_string(),
            port: DEFAULT_ELECTRUM_PORT,
            network: Network::Regtest,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Transaction cache bounds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached transactions before FIFO eviction.
    pub max_entries: usize,
    /// Seconds a cached transaction stays servable.
    pub ttl_secs: u64,
    /// Interval between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_secs: DEFAULT_CACHE_SWEEP_SECS,
        }
    }
}

/// Discovery and spending policy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Consecutive empty addresses tolerated before a chain is
    /// considered exhausted.
    pub gap_limit: u32,
    /// Confirmations required before a transaction counts as confirmed.
    pub min_confirmations: u64,
    /// Let coin selection pick mempool and sub-threshold outputs.
    pub allow_unconfirmed_spends: bool,
    /// BIP43 purpose of the single tracked account.
    pub purpose: u32,
    /// Account index of the single tracked account.
    pub account: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            allow_unconfirmed_spends: false,
            purpose: DEFAULT_PURPOSE,
            account: DEFAULT_ACCOUNT,
        }
    }
}

/// Fee validation bounds for the transaction builder.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeeConfig {
    /// Highest accepted fee rate in sats per vbyte.
    pub max_sats_per_vbyte: u64,
    /// Threshold below which outputs are rejected as dust.
    pub dust_limit_sats: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            max_sats_per_vbyte: DEFAULT_MAX_FEE_RATE,
            dust_limit_sats: DEFAULT_DUST_LIMIT,
        }
    }
}

/// On-disk layout.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the wallet's key-value trees.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet"),
        }
    }
}
