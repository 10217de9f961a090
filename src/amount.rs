use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Satoshis per whole coin.
pub const SATS_PER_COIN: u64 = 100_000_000;

/// Denomination selector for amounts supplied by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Base units (satoshis).
    Base,
    /// Main units (whole coins), written as a decimal string.
    Main,
}

/// An exact integer quantity of satoshis.
///
/// All wallet arithmetic happens on this type; rendering in main units is
/// a formatting concern only. Construction from main units parses the
/// decimal text directly so no floating-point rounding is involved.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("malformed amount `{0}`")]
    Malformed(String),
    #[error("amount `{0}` has more than 8 fractional digits")]
    TooPrecise(String),
    #[error("amount arithmetic overflowed")]
    Overflow,
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_sats(sats: u64) -> Self {
        Amount(sats)
    }

    pub const fn to_sats(self) -> u64 {
        self.0
    }

    /// Parse a decimal main-unit string such as `"0.00005000"`.
    pub fn from_main(text: &str) -> Result<Self, AmountError> {
        let text = text.trim();
        let malformed = || AmountError::Malformed(text.to_string());
        let (whole, frac) = match text.split_once('.') {
            Some((w, f)) => (w, f),
            None => (text, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(malformed());
        }
        if frac.len() > 8 {
            return Err(AmountError::TooPrecise(text.to_string()));
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| malformed())?
        };
        let mut frac_sats: u64 = 0;
        if !frac.is_empty() {
            frac_sats = frac.parse().map_err(|_| malformed())?;
            for _ in frac.len()..8 {
                frac_sats *= 10;
            }
        }
        whole
            .checked_mul(SATS_PER_COIN)
            .and_then(|w| w.checked_add(frac_sats))
            .map(Amount)
            .ok_or(AmountError::Overflow)
    }

    /// Interpret `text` according to `unit`.
    pub fn parse(text: &str, unit: Unit) -> Result<Self, AmountError> {
        match unit {
            Unit::Base => text
                .trim()
                .parse()
                .map(Amount)
                .map_err(|_| AmountError::Malformed(text.to_string())),
            Unit::Main => Self::from_main(text),
        }
    }

    /// Convert a main-unit JSON number (the one float boundary in the
    /// system: Electrum's verbose transaction `value` fields) to sats,
    /// rounding to the nearest integer.
    pub fn from_main_f64(value: f64) -> Self {
        Amount((value * SATS_PER_COIN as f64).round() as u64)
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    /// Scale by an integer factor (fee rate × weight).
    pub fn checked_scale(self, factor: u64) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Render as a main-unit decimal string with all 8 fractional digits.
    pub fn to_main_string(self) -> String {
        format!(
            "{}.{:08}",
            self.0 / SATS_PER_COIN,
            self.0 % SATS_PER_COIN
        )
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        Amount(iter.map(|a| a.0).sum())
    }
}

impl From<u64> for Amount {
    fn from(sats: u64) -> Self {
        Amount(sats)
    }
}
