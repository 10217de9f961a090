use sha2::{Digest, Sha256};

use super::{
    DerivedKey, HdPath, KeyError, KeyManager, Network, ScriptHash, SignedTransaction,
    SigningRequest,
};

const INPUT_VBYTES: u64 = 148;
const OUTPUT_VBYTES: u64 = 34;
const OVERHEAD_VBYTES: u64 = 10;

/// Deterministic key manager derived from a 32-byte seed.
///
/// Derivation hashes the seed together with the path components, so the
/// same seed always yields the same script hashes and addresses. Signing
/// produces a synthetic but stable serialization whose virtual size
/// follows the input/output counts, which is what the fee machinery
/// needs. Real wallets supply a BIP32-backed implementation instead.
pub struct SeedKeyManager {
    seed: [u8; 32],
    network: Network,
}

impl SeedKeyManager {
    pub fn new(seed: [u8; 32], network: Network) -> Self {
        Self { seed, network }
    }

    fn address_prefix(&self) -> &'static str {
        match self.network {
            Network::Mainnet => "bc1q",
            Network::Testnet | Network::Signet => "tb1q",
            Network::Regtest => "bcrt1q",
        }
    }

    fn derive_public_key(&self, path: &HdPath) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"pubkey");
        hasher.update(self.seed);
        hasher.update(path.purpose.to_be_bytes());
        hasher.update(path.coin.to_be_bytes());
        hasher.update(path.account.to_be_bytes());
        hasher.update(path.chain.as_u32().to_be_bytes());
        hasher.update(path.index.to_be_bytes());
        hasher.finalize().to_vec()
    }
}

impl KeyManager for SeedKeyManager {
    fn network(&self) -> Network {
        self.network
    }

    fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.seed);
        hex::encode(&digest[..4])
    }

    fn derive(&self, path: &HdPath) -> Result<DerivedKey, KeyError> {
        path.address_type()?;
        let public_key = self.derive_public_key(path);
        let key_hash = Sha256::digest(&public_key);
        // Synthetic v0 witness program over the truncated key hash.
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&key_hash[..20]);
        let script_hash = ScriptHash(Sha256::digest(&script).into());
        let address = format!("{}{}", self.address_prefix(), hex::encode(&key_hash[..20]));
        Ok(DerivedKey {
            path: *path,
            script_hash,
            address,
            public_key,
        })
    }

    fn sign(&self, request: &SigningRequest) -> Result<SignedTransaction, KeyError> {
        if request.inputs.is_empty() {
            return Err(KeyError::Signing("transaction has no inputs".into()));
        }
        if request.outputs.is_empty() {
            return Err(KeyError::Signing("transaction has no outputs".into()));
        }
        let payload =
            bincode::serialize(request).map_err(|err| KeyError::Signing(err.to_string()))?;
        let mut body = payload.clone();
        for input in &request.inputs {
            let mut hasher = Sha256::new();
            hasher.update(b"witness");
            hasher.update(self.seed);
            hasher.update(&payload);
            hasher.update(input.txid.as_bytes());
            hasher.update(input.index.to_be_bytes());
            body.extend_from_slice(&hasher.finalize());
        }
        let txid = hex::encode(Sha256::digest(&body));
        let vsize = OVERHEAD_VBYTES
            + request.inputs.len() as u64 * INPUT_VBYTES
            + request.outputs.len() as u64 * OUTPUT_VBYTES;
        Ok(SignedTransaction {
            txid,
            hex: hex::encode(body),
            vsize,
        })
    }
}
