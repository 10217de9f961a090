//! Hierarchical-deterministic Bitcoin wallet core.
//!
//! The crate tracks on-chain activity by speaking the Electrum protocol
//! over a persistent newline-delimited JSON-RPC connection. Four
//! subsystems cooperate: the [`electrum`] transport/provider stack, the
//! [`sync`] manager driving gap-limit discovery, the [`ledger`] holding
//! per-address balances and history, and the [`builder`] producing
//! weight-correct signed transactions.
//!
//! Key derivation, signing and address encoding live behind the
//! [`keys::KeyManager`] seam; the on-disk layout lives behind
//! [`store::KvStore`].

pub mod amount;
pub mod builder;
pub mod config;
pub mod electrum;
pub mod events;
pub mod keys;
pub mod ledger;
pub mod store;
pub mod sync;

pub use amount::{Amount, Unit};
pub use config::WalletConfig;
pub use events::WalletEvent;
