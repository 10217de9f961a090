use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External (receive) or internal (change) derivation chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn as_u32(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, PathError> {
        match value {
            0 => Ok(Chain::External),
            1 => Ok(Chain::Internal),
            other => Err(PathError::InvalidChain(other)),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::External => write!(f, "external"),
            Chain::Internal => write!(f, "internal"),
        }
    }
}

/// Address kind implied by the BIP43 purpose field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2tr,
}

/// A single-account BIP32 derivation path `m/P'/C'/A'/ch/i`.
///
/// The purpose, coin and account components are hardened; the chain and
/// index are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HdPath {
    pub purpose: u32,
    pub coin: u32,
    pub account: u32,
    pub chain: Chain,
    pub index: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed derivation path `{0}`")]
    Malformed(String),
    #[error("chain component must be 0 or 1, got {0}")]
    InvalidChain(u32),
    #[error("unsupported purpose {0}'")]
    UnsupportedPurpose(u32),
}

impl HdPath {
    pub fn new(purpose: u32, coin: u32, account: u32, chain: Chain, index: u32) -> Self {
        Self {
            purpose,
            coin,
            account,
            chain,
            index,
        }
    }

    /// The same path with `index + 1`. Indices are monotone; callers never
    /// hand out an index twice.
    pub fn bump_index(self) -> Self {
        Self {
            index: self.index + 1,
            ..self
        }
    }

    pub fn with_index(self, index: u32) -> Self {
        Self { index, ..self }
    }

    pub fn with_chain(self, chain: Chain) -> Self {
        Self { chain, ..self }
    }

    pub fn address_type(&self) -> Result<AddressType, PathError> {
        match self.purpose {
            44 => Ok(AddressType::P2pkh),
            49 => Ok(AddressType::P2shP2wpkh),
            84 => Ok(AddressType::P2wpkh),
            86 => Ok(AddressType::P2tr),
            other => Err(PathError::UnsupportedPurpose(other)),
        }
    }
}

impl fmt::Display for HdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'/{}/{}",
            self.purpose,
            self.coin,
            self.account,
            self.chain.as_u32(),
            self.index
        )
    }
}

impl FromStr for HdPath {
    type Err = PathError;

    fn from_str(text: &str) -> Result<Self, PathError> {
        let malformed = || PathError::Malformed(text.to_string());
        let mut parts = text.split('/');
        if parts.next() != Some("m") {
            return Err(malformed());
        }
        let mut hardened = |expect: bool| -> Result<u32, PathError> {
            let part = parts.next().ok_or_else(malformed)?;
            let (digits, is_hardened) = match part.strip_suffix('\'') {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            if is_hardened != expect {
                return Err(malformed());
            }
            digits.parse().map_err(|_| malformed())
        };
        let purpose = hardened(true)?;
        let coin = hardened(true)?;
        let account = hardened(true)?;
        let chain = Chain::from_u32(hardened(false)?)?;
        let index = hardened(false)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(HdPath::new(purpose, coin, account, chain, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_and_parses() {
        let path = HdPath::new(84, 0, 0, Chain::External, 7);
        assert_eq!(path.to_string(), "m/84'/0'/0'/0/7");
        assert_eq!("m/84'/0'/0'/0/7".parse::<HdPath>().unwrap(), path);

        let change = HdPath::new(44, 1, 2, Chain::Internal, 0);
        assert_eq!(change.to_string(), "m/44'/1'/2'/1/0");
        assert_eq!("m/44'/1'/2'/1/0".parse::<HdPath>().unwrap(), change);
    }

    #[test]
    fn rejects_malformed_paths() {
        for text in ["", "m", "m/84/0'/0'/0/1", "m/84'/0'/0'/2/1", "m/84'/0'/0'/0/1/9"] {
            assert!(text.parse::<HdPath>().is_err(), "{text}");
        }
    }

    #[test]
    fn bump_is_monotone() {
        let path = HdPath::new(84, 0, 0, Chain::Internal, 3);
        let next = path.bump_index();
        assert_eq!(next.index, 4);
        assert_eq!(next.chain, Chain::Internal);
    }

    #[test]
    fn purpose_maps_to_address_type() {
        let at = |purpose| HdPath::new(purpose, 0, 0, Chain::External, 0).address_type();
        assert_eq!(at(44).unwrap(), AddressType::P2pkh);
        assert_eq!(at(49).unwrap(), AddressType::P2shP2wpkh);
        assert_eq!(at(84).unwrap(), AddressType::P2wpkh);
        assert_eq!(at(86).unwrap(), AddressType::P2tr);
        assert_eq!(at(99), Err(PathError::UnsupportedPurpose(99)));
    }
}
