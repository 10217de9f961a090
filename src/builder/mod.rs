//! Coin selection plus fee-aware transaction construction.
//!
//! The builder iterates to a weight-correct transaction in two passes: a
//! probe pass signs at weight 1 to measure the real virtual size, the
//! finalize pass re-signs with the fee computed from that measurement.
//! UTXO locks taken along the way are always released before an error
//! reaches the caller.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::amount::{Amount, AmountError, Unit};
use crate::keys::{Chain, KeyError, SignedTransaction, SigningInput, SigningOutput, SigningRequest};
use crate::ledger::LedgerError;
use crate::sync::{SyncError, SyncManager, UtxoSelection};

/// Minimum economical output value in satoshis.
pub const DUST_LIMIT_SATS: u64 = 546;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("fee rate {requested} outside (0, {maximum}] sat/vB")]
    InvalidFeeRate { requested: u64, maximum: u64 },
    #[error("output of {value} below dust limit {dust_limit}")]
    DustOutput { value: Amount, dust_limit: Amount },
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },
    #[error("broadcast rejected: {message}")]
    Broadcast { message: String },
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Sync(SyncError),
}

impl From<SyncError> for BuilderError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InsufficientFunds {
                required,
                available,
            } => BuilderError::InsufficientFunds {
                required,
                available,
            },
            other => BuilderError::Sync(other),
        }
    }
}

/// A payment the wallet should make.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub address: String,
    pub amount: Amount,
    /// Satoshis per virtual byte.
    pub fee_rate: u64,
}

impl SendRequest {
    pub fn new(
        address: impl Into<String>,
        amount: &str,
        unit: Unit,
        fee_rate: u64,
    ) -> Result<Self, AmountError> {
        Ok(Self {
            address: address.into(),
            amount: Amount::parse(amount, unit)?,
            fee_rate,
        })
    }
}

/// The broadcast transaction and its final economics.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub txid: String,
    pub hex: String,
    pub fee: Amount,
    pub vsize: u64,
    pub change: Amount,
}

/// Builds, signs and broadcasts transactions against the sync manager's
/// UTXO set.
pub struct TransactionBuilder {
    sync: Arc<SyncManager>,
    dust_limit: Amount,
    max_fee_rate: u64,
}

impl TransactionBuilder {
    pub fn new(sync: Arc<SyncManager>, dust_limit_sats: u64, max_fee_rate: u64) -> Self {
        Self {
            sync,
            dust_limit: Amount::from_sats(dust_limit_sats),
            max_fee_rate,
        }
    }

    pub fn dust_limit(&self) -> Amount {
        self.dust_limit
    }

    fn validate(&self, request: &SendRequest) -> Result<(), BuilderError> {
        if request.fee_rate == 0 || request.fee_rate > self.max_fee_rate {
            return Err(BuilderError::InvalidFeeRate {
                requested: request.fee_rate,
                maximum: self.max_fee_rate,
            });
        }
        if request.amount <= self.dust_limit {
            return Err(BuilderError::DustOutput {
                value: request.amount,
                dust_limit: self.dust_limit,
            });
        }
        Ok(())
    }

    /// Build, sign and broadcast. UTXO locks release on every outcome:
    /// spent on success, returned to the pool on failure.
    pub async fn send_transaction(
        &self,
        request: &SendRequest,
    ) -> Result<SendOutcome, BuilderError> {
        self.validate(request)?;
        match self.build_and_broadcast(request).await {
            Ok(outcome) => {
                self.sync.unlock_utxo(true)?;
                self.sync
                    .ledger()
                    .record_broadcast(&outcome.txid, &outcome.hex)?;
                info!(txid = %outcome.txid, fee = %outcome.fee, vsize = outcome.vsize, "transaction broadcast");
                Ok(outcome)
            }
            Err(err) => {
                self.sync.unlock_utxo(false).map_err(BuilderError::Sync)?;
                Err(err)
            }
        }
    }

    async fn build_and_broadcast(&self, request: &SendRequest) -> Result<SendOutcome, BuilderError> {
        let fee_rate = request.fee_rate;
        let amount = request.amount;

        // The change output reuses one derivation across both passes.
        let change_path = self.sync.next_internal_path()?;
        let change_key = self.sync.keys().derive(&change_path)?;
        self.sync.watch_address(&change_key, Chain::Internal).await?;

        // Probe pass at weight 1 to measure the real virtual size. One
        // UTXO re-request is allowed across both passes when the
        // selection cannot produce a spendable change output.
        let mut refetch_used = false;
        let (selection, probe_change) =
            self.resolve_funding(amount, fee_rate, 1, None, &mut refetch_used)?;
        let probe = self.sign(request, &selection, &change_key.address, probe_change)?;

        // Finalize pass at the measured virtual size; the change is
        // zero or above the dust limit once this resolves.
        let fee = self.scaled_fee(fee_rate, probe.vsize)?;
        let (selection, final_change) = self.resolve_funding(
            amount,
            fee_rate,
            probe.vsize,
            Some(selection),
            &mut refetch_used,
        )?;
        let signed = self.sign(request, &selection, &change_key.address, final_change)?;

        let txid = match self.sync.provider().broadcast_transaction(&signed.hex).await {
            Ok(txid) => txid,
            Err(err) => {
                return Err(BuilderError::Broadcast {
                    message: err.to_string(),
                })
            }
        };

        Ok(SendOutcome {
            txid,
            hex: signed.hex,
            fee,
            vsize: signed.vsize,
            change: final_change,
        })
    }

    /// Produce a selection whose change at `fee_rate × weight` is zero
    /// or at least the dust limit, re-requesting UTXOs at most once
    /// across the builder's two passes.
    ///
    /// With the re-request spent, an underfunded selection fails with
    /// `InsufficientFunds`; a funded one whose remainder sits in
    /// `(0, dust)` fails with `DustOutput`.
    fn resolve_funding(
        &self,
        amount: Amount,
        fee_rate: u64,
        weight: u64,
        existing: Option<UtxoSelection>,
        refetch_used: &mut bool,
    ) -> Result<(UtxoSelection, Amount), BuilderError> {
        let fee = self.scaled_fee(fee_rate, weight)?;
        let required = amount.checked_add(fee).ok_or_else(overflow)?;
        let mut selection = match existing {
            Some(selection) => selection,
            None => self.sync.utxo_for_amount(required)?,
        };
        loop {
            let shortfall = match self.change_for(&selection, amount, fee) {
                ChangeOutcome::Usable(change) => return Ok((selection, change)),
                shortfall => shortfall,
            };
            if *refetch_used {
                return Err(match shortfall {
                    ChangeOutcome::SubDust(change) => BuilderError::DustOutput {
                        value: change,
                        dust_limit: self.dust_limit,
                    },
                    _ => BuilderError::InsufficientFunds {
                        required,
                        available: selection.total,
                    },
                });
            }
            *refetch_used = true;
            let retry_target = selection
                .total
                .checked_add(Amount::from_sats(fee_rate))
                .ok_or_else(overflow)?
                .max(required);
            debug!(%retry_target, "change below dust; re-requesting utxos");
            self.sync.unlock_utxo(false)?;
            selection = self.sync.utxo_for_amount(retry_target)?;
        }
    }

    /// Classify the remainder the selection leaves after `amount + fee`.
    fn change_for(&self, selection: &UtxoSelection, amount: Amount, fee: Amount) -> ChangeOutcome {
        let Some(change) = amount
            .checked_add(fee)
            .and_then(|spend| selection.total.checked_sub(spend))
        else {
            return ChangeOutcome::Underfunded;
        };
        if !change.is_zero() && change < self.dust_limit {
            return ChangeOutcome::SubDust(change);
        }
        ChangeOutcome::Usable(change)
    }

    fn scaled_fee(&self, fee_rate: u64, weight: u64) -> Result<Amount, BuilderError> {
        Amount::from_sats(fee_rate)
            .checked_scale(weight)
            .ok_or_else(overflow)
    }

    /// Assemble the signing request (recipient first, change second when
    /// nonzero) and hand it to the key manager.
    fn sign(
        &self,
        request: &SendRequest,
        selection: &UtxoSelection,
        change_address: &str,
        change: Amount,
    ) -> Result<SignedTransaction, BuilderError> {
        let inputs = selection
            .utxos
            .iter()
            .map(|utxo| SigningInput {
                txid: utxo.txid.clone(),
                index: utxo.index,
                value: utxo.value,
                script_hex: utxo.script_hex.clone(),
                path: utxo.path,
                public_key: utxo.public_key.clone(),
            })
            .collect();
        let mut outputs = vec![SigningOutput {
            address: request.address.clone(),
            value: request.amount,
        }];
        if !change.is_zero() {
            outputs.push(SigningOutput {
                address: change_address.to_string(),
                value: change,
            });
        }
        Ok(self.sync.keys().sign(&SigningRequest { inputs, outputs })?)
    }
}

/// How a selection relates to the spend it should fund.
enum ChangeOutcome {
    /// Zero or spendable change remains.
    Usable(Amount),
    /// Funds cover the spend but the remainder is below the dust limit.
    SubDust(Amount),
    /// The selection does not cover `amount + fee`.
    Underfunded,
}

fn overflow() -> BuilderError {
    BuilderError::InsufficientFunds {
        required: Amount::from_sats(u64::MAX),
        available: Amount::ZERO,
    }
}
