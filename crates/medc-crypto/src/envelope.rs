//! Encrypted message envelope and its wire format.
//!
//! Wire: `base64(nonce || ciphertext+tag)` using the standard padded
//! alphabet. An empty message is carried as the empty string and never
//! touches the cipher.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::provider::{NONCE_LEN, TAG_LEN};

/// Smallest sealed envelope: a nonce plus a bare tag.
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload is not valid base64")]
    NotBase64,
    #[error("envelope too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
}

/// One encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedEnvelope {
    /// Sentinel for the empty message.
    Empty,
    Sealed { nonce: Vec<u8>, ciphertext: Vec<u8> },
}

impl EncryptedEnvelope {
    pub fn sealed(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Result<Self, EnvelopeError> {
        if nonce.len() != NONCE_LEN {
            return Err(EnvelopeError::InvalidNonceLength {
                expected: NONCE_LEN,
                got: nonce.len(),
            });
        }
        if ciphertext.len() < TAG_LEN {
            return Err(EnvelopeError::TooShort {
                len: NONCE_LEN + ciphertext.len(),
                min: MIN_SEALED_LEN,
            });
        }
        Ok(Self::Sealed { nonce, ciphertext })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => None,
            Self::Sealed { nonce, .. } => Some(nonce),
        }
    }

    pub fn ciphertext(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => None,
            Self::Sealed { ciphertext, .. } => Some(ciphertext),
        }
    }

    /// `nonce || ciphertext+tag`; empty for the sentinel.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Sealed { nonce, ciphertext } => {
                let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
                out.extend_from_slice(nonce);
                out.extend_from_slice(ciphertext);
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.is_empty() {
            return Ok(Self::Empty);
        }
        if bytes.len() < MIN_SEALED_LEN {
            return Err(EnvelopeError::TooShort {
                len: bytes.len(),
                min: MIN_SEALED_LEN,
            });
        }
        let (nonce, ct) = bytes.split_at(NONCE_LEN);
        Ok(Self::Sealed {
            nonce: nonce.to_vec(),
            ciphertext: ct.to_vec(),
        })
    }

    /// Text-safe transport encoding.
    pub fn to_payload(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Sealed { .. } => STANDARD.encode(self.to_bytes()),
        }
    }

    pub fn from_payload(payload: &str) -> Result<Self, EnvelopeError> {
        if payload.is_empty() {
            return Ok(Self::Empty);
        }
        let bytes = STANDARD
            .decode(payload.as_bytes())
            .map_err(|_| EnvelopeError::NotBase64)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedEnvelope {
        EncryptedEnvelope::sealed(vec![1u8; NONCE_LEN], vec![2u8; TAG_LEN + 5]).unwrap()
    }

    #[test]
    fn test_payload_round_trip() {
        let env = sample();
        let payload = env.to_payload();
        assert_eq!(EncryptedEnvelope::from_payload(&payload).unwrap(), env);
    }

    #[test]
    fn test_wire_layout_is_nonce_then_ciphertext() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), NONCE_LEN + TAG_LEN + 5);
        assert!(bytes[..NONCE_LEN].iter().all(|b| *b == 1));
        assert!(bytes[NONCE_LEN..].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_empty_sentinel() {
        assert_eq!(EncryptedEnvelope::Empty.to_payload(), "");
        assert_eq!(
            EncryptedEnvelope::from_payload("").unwrap(),
            EncryptedEnvelope::Empty
        );
        assert!(EncryptedEnvelope::Empty.nonce().is_none());
    }

    #[test]
    fn test_too_short_rejected() {
        let short = STANDARD.encode([0u8; MIN_SEALED_LEN - 1]);
        assert_eq!(
            EncryptedEnvelope::from_payload(&short),
            Err(EnvelopeError::TooShort {
                len: MIN_SEALED_LEN - 1,
                min: MIN_SEALED_LEN
            })
        );
    }

    #[test]
    fn test_not_base64_rejected() {
        assert_eq!(
            EncryptedEnvelope::from_payload("plain unencrypted text"),
            Err(EnvelopeError::NotBase64)
        );
    }

    #[test]
    fn test_sealed_validates_nonce() {
        assert!(matches!(
            EncryptedEnvelope::sealed(vec![0u8; 8], vec![0u8; TAG_LEN]),
            Err(EnvelopeError::InvalidNonceLength { .. })
        ));
    }
}
