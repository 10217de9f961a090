use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Confirmation bucket a transaction's contribution currently sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Confirmed,
    Pending,
    Mempool,
}

/// One side of an address balance: three bucket totals plus the
/// per-transaction contributions that make them up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: Amount,
    pub pending: Amount,
    pub mempool: Amount,
    confirmed_txs: Vec<(String, Amount)>,
    pending_txs: Vec<(String, Amount)>,
    mempool_txs: Vec<(String, Amount)>,
}

impl Balance {
    /// Record `amount` for `txid` in `bucket`.
    ///
    /// Idempotent across buckets: any prior contribution of the same
    /// txid is removed (its amount subtracted) first, which is what
    /// moves a transaction between buckets without double counting.
    pub fn add_txid(&mut self, bucket: Bucket, txid: &str, amount: Amount) {
        self.remove_txid(txid);
        match bucket {
            Bucket::Confirmed => {
                self.confirmed += amount;
                self.confirmed_txs.push((txid.to_string(), amount));
            }
            Bucket::Pending => {
                self.pending += amount;
                self.pending_txs.push((txid.to_string(), amount));
            }
            Bucket::Mempool => {
                self.mempool += amount;
                self.mempool_txs.push((txid.to_string(), amount));
            }
        }
    }

    /// Remove any contribution recorded for `txid`, from whichever
    /// bucket holds it.
    pub fn remove_txid(&mut self, txid: &str) {
        if let Some(pos) = self.confirmed_txs.iter().position(|(t, _)| t == txid) {
            let (_, amount) = self.confirmed_txs.remove(pos);
            self.confirmed = self.confirmed.saturating_sub(amount);
        }
        if let Some(pos) = self.pending_txs.iter().position(|(t, _)| t == txid) {
            let (_, amount) = self.pending_txs.remove(pos);
            self.pending = self.pending.saturating_sub(amount);
        }
        if let Some(pos) = self.mempool_txs.iter().position(|(t, _)| t == txid) {
            let (_, amount) = self.mempool_txs.remove(pos);
            self.mempool = self.mempool.saturating_sub(amount);
        }
    }

    /// Where (and how much) `txid` currently contributes.
    pub fn contribution(&self, txid: &str) -> Option<(Bucket, Amount)> {
        let find = |list: &[(String, Amount)], bucket: Bucket| {
            list.iter()
                .find(|(t, _)| t == txid)
                .map(|(_, amount)| (bucket, *amount))
        };
        find(&self.confirmed_txs, Bucket::Confirmed)
            .or_else(|| find(&self.pending_txs, Bucket::Pending))
            .or_else(|| find(&self.mempool_txs, Bucket::Mempool))
    }

    pub fn bucket_total(&self, bucket: Bucket) -> Amount {
        match bucket {
            Bucket::Confirmed => self.confirmed,
            Bucket::Pending => self.pending,
            Bucket::Mempool => self.mempool,
        }
    }

    pub fn total(&self) -> Amount {
        self.confirmed + self.pending + self.mempool
    }

    /// Elementwise difference `self − other`, reported as signed totals.
    pub fn combine(&self, other: &Balance) -> BalanceSummary {
        let diff = |a: Amount, b: Amount| a.to_sats() as i128 - b.to_sats() as i128;
        let confirmed = diff(self.confirmed, other.confirmed);
        let pending = diff(self.pending, other.pending);
        let mempool = diff(self.mempool, other.mempool);
        BalanceSummary {
            confirmed,
            pending,
            mempool,
            consolidated: confirmed + pending + mempool,
        }
    }
}

/// Signed three-bucket totals plus their sum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub confirmed: i128,
    pub pending: i128,
    pub mempool: i128,
    pub consolidated: i128,
}

impl BalanceSummary {
    fn minus(self, other: BalanceSummary) -> BalanceSummary {
        BalanceSummary {
            confirmed: self.confirmed - other.confirmed,
            pending: self.pending - other.pending,
            mempool: self.mempool - other.mempool,
            consolidated: self.consolidated - other.consolidated,
        }
    }
}

/// Ledger record for one address: credits, debits and attributed fees.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub incoming: Balance,
    pub outgoing: Balance,
    pub fees: Balance,
}

impl AddressEntry {
    /// Net position: `incoming − outgoing − fees`, per bucket.
    pub fn net(&self) -> BalanceSummary {
        self.incoming
            .combine(&self.outgoing)
            .minus(self.fees.combine(&Balance::default()))
    }
}
