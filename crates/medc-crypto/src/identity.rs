//! Identity key material for a local user.
//!
//! An `IdentityKeyBundle` holds the static X25519 agreement keypair and the
//! sealing keypair used for key wrapping. Private halves only leave this type
//! through `StoredIdentity`, which the key store persists.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::{Algorithm, PeerKeys, PublicKeyBundle};
use crate::provider::{CryptoError, CryptoProvider, Keypair};

/// Error type for identity (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid key encoding")]
    InvalidEncoding,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// The local user's long-lived key material.
#[derive(Debug, Clone)]
pub struct IdentityKeyBundle {
    agreement: Keypair,
    encryption: Option<Keypair>,
    generation: u32,
    created_at: i64,
}

impl IdentityKeyBundle {
    /// Generate fresh agreement and sealing keypairs.
    pub fn generate(provider: &dyn CryptoProvider, now_unix: i64) -> Result<Self, CryptoError> {
        Ok(Self {
            agreement: provider.generate_agreement_keypair()?,
            encryption: Some(provider.generate_encryption_keypair()?),
            generation: 1,
            created_at: now_unix,
        })
    }

    /// New bundle with a fresh agreement keypair and the same sealing keypair.
    pub fn rotated(&self, provider: &dyn CryptoProvider, now_unix: i64) -> Result<Self, CryptoError> {
        Ok(Self {
            agreement: provider.generate_agreement_keypair()?,
            encryption: self.encryption.clone(),
            generation: self.generation + 1,
            created_at: now_unix,
        })
    }

    pub fn agreement(&self) -> &Keypair {
        &self.agreement
    }

    pub fn encryption(&self) -> Option<&Keypair> {
        self.encryption.as_ref()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn public_bundle(&self) -> PublicKeyBundle {
        self.agreement.public_bundle()
    }

    pub fn public_keys(&self) -> PeerKeys {
        PeerKeys {
            agreement: self.agreement.public_bundle(),
            encryption: self.encryption.as_ref().map(Keypair::public_bundle),
        }
    }

    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            agreement_secret: STANDARD.encode(*self.agreement.secret_bytes()),
            encryption_secret: self
                .encryption
                .as_ref()
                .map(|kp| STANDARD.encode(*kp.secret_bytes())),
            generation: self.generation,
            created_at: self.created_at,
        }
    }

    pub fn from_stored(stored: &StoredIdentity) -> Result<Self, IdentityError> {
        let agreement = Keypair::from_secret_bytes(
            Algorithm::X25519,
            *decode_secret(&stored.agreement_secret)?,
        );
        let encryption = match &stored.encryption_secret {
            Some(s) => Some(Keypair::from_secret_bytes(
                Algorithm::X25519Seal,
                *decode_secret(s)?,
            )),
            None => None,
        };
        Ok(Self {
            agreement,
            encryption,
            generation: stored.generation,
            created_at: stored.created_at,
        })
    }
}

/// Persisted form of an identity. Only ever written to the local key store.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    agreement_secret: String,
    #[serde(default)]
    encryption_secret: Option<String>,
    generation: u32,
    created_at: i64,
}

fn decode_secret(s: &str) -> Result<Zeroizing<[u8; 32]>, IdentityError> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(s.as_bytes())
            .map_err(|_| IdentityError::InvalidEncoding)?,
    );
    if bytes.len() != 32 {
        return Err(IdentityError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        });
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&bytes);
    Ok(out)
}
