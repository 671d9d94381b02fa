//! Public key bundles.
//!
//! A `PublicKeyBundle` is the shareable half of a local keypair:
//! `{ "algorithm": "X25519", "key": "<base64>" }`. Older clients sent the key
//! as a JSON array of byte values, so deserialization accepts both forms.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::fingerprint;

/// X25519 public keys are 32 bytes for both agreement and sealing.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Error type for bundle validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("unexpected algorithm for {slot}: {got}")]
    WrongAlgorithm { slot: &'static str, got: Algorithm },
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Algorithm tag carried by every exported public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Static X25519 key used for conversation key agreement.
    #[serde(rename = "X25519")]
    X25519,
    /// X25519 key used to seal (wrap) symmetric keys for out-of-band transfer.
    #[serde(rename = "X25519-SEAL")]
    X25519Seal,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::X25519 => "X25519",
            Algorithm::X25519Seal => "X25519-SEAL",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "X25519" => Ok(Algorithm::X25519),
            "X25519-SEAL" => Ok(Algorithm::X25519Seal),
            other => Err(BundleError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Exported public key: algorithm tag plus raw key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    pub algorithm: Algorithm,
    #[serde(serialize_with = "key_to_base64", deserialize_with = "key_from_wire")]
    pub key: Vec<u8>,
}

impl PublicKeyBundle {
    pub fn new(algorithm: Algorithm, key: Vec<u8>) -> Self {
        Self { algorithm, key }
    }

    /// Check the key length for the tagged algorithm.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.key.len() != PUBLIC_KEY_LEN {
            return Err(BundleError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: self.key.len(),
            });
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

/// The set of public keys a user publishes to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerKeys {
    /// Key-agreement key (required).
    pub agreement: PublicKeyBundle,
    /// Sealing key for key wrapping (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<PublicKeyBundle>,
}

impl PeerKeys {
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.agreement.algorithm != Algorithm::X25519 {
            return Err(BundleError::WrongAlgorithm {
                slot: "agreement",
                got: self.agreement.algorithm,
            });
        }
        self.agreement.validate()?;

        if let Some(enc) = &self.encryption {
            if enc.algorithm != Algorithm::X25519Seal {
                return Err(BundleError::WrongAlgorithm {
                    slot: "encryption",
                    got: enc.algorithm,
                });
            }
            enc.validate()?;
        }
        Ok(())
    }
}

fn key_to_base64<S: Serializer>(key: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(key))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireKey {
    Base64(String),
    Bytes(Vec<u8>),
}

fn key_from_wire<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    match WireKey::deserialize(d)? {
        WireKey::Base64(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
        WireKey::Bytes(b) => Ok(b),
    }
}
