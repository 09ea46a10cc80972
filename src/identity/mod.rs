use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

pub type AccountId = String;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("secret key must be hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("secret key must be 32 bytes (64 hex characters), got {0} bytes")]
    Length(usize),
}

/// A submitter: the key that signs transactions and the account it maps to.
#[derive(Clone)]
pub struct Identity {
    key: SigningKey,
}

impl Identity {
    pub fn from_secret_hex(secret: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(secret.trim())?;
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Length(bytes.len()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&raw),
        })
    }

    /// Development identity `index` derived from a published seed, the way a
    /// local test chain hands out pre-unlocked accounts.
    pub fn dev(seed: u64, index: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ (u64::from(index) << 32 | u64::from(index)));
        let mut raw = [0u8; 32];
        rng.fill_bytes(&mut raw);
        Self {
            key: SigningKey::from_bytes(&raw),
        }
    }

    pub fn dev_accounts(seed: u64, count: u32) -> Vec<AccountId> {
        (0..count).map(|idx| Self::dev(seed, idx).account()).collect()
    }

    pub fn account(&self) -> AccountId {
        account_of(&self.key.verifying_key())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, digest: &[u8; 32]) -> Signature {
        self.key.sign(digest)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account", &self.account())
            .finish_non_exhaustive()
    }
}

/// `0x` followed by the first 20 bytes of SHA-256 over the public key.
pub fn account_of(key: &VerifyingKey) -> AccountId {
    let digest = Sha256::digest(key.as_bytes());
    format!("0x{}", hex::encode(&digest[..20]))
}
