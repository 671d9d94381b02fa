//! Inbound payload classification.
//!
//! Messages stored before encryption was rolled out are plain text. Nothing
//! in the payload says which kind it is, so this is a best-effort heuristic:
//! a payload is treated as ciphertext only when it is standard padded base64
//! and decodes to at least nonce + tag bytes. Everything else is historical
//! plaintext.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::envelope::{EncryptedEnvelope, MIN_SEALED_LEN};

/// Why a payload was judged to be plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyReason {
    /// Contains characters outside the base64 alphabet, or bad padding.
    NotBase64,
    /// Decodes, but is shorter than nonce + tag.
    TooShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    Empty,
    Ciphertext(EncryptedEnvelope),
    Plaintext(LegacyReason),
}

/// Alphabet and padding check only; does not decode.
pub fn looks_like_base64(payload: &str) -> bool {
    if payload.trim().is_empty() || payload.len() % 4 != 0 {
        return false;
    }
    let body = payload.trim_end_matches('=');
    if payload.len() - body.len() > 2 {
        return false;
    }
    body.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

pub fn classify(payload: &str) -> PayloadKind {
    if payload.is_empty() {
        return PayloadKind::Empty;
    }
    if !looks_like_base64(payload) {
        return PayloadKind::Plaintext(LegacyReason::NotBase64);
    }
    let bytes = match STANDARD.decode(payload.as_bytes()) {
        Ok(b) => b,
        Err(_) => return PayloadKind::Plaintext(LegacyReason::NotBase64),
    };
    if bytes.len() < MIN_SEALED_LEN {
        return PayloadKind::Plaintext(LegacyReason::TooShort);
    }
    match EncryptedEnvelope::from_bytes(&bytes) {
        Ok(env) => PayloadKind::Ciphertext(env),
        Err(_) => PayloadKind::Plaintext(LegacyReason::TooShort),
    }
}
