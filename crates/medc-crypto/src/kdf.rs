//! Conversation key derivation.
//!
//! Two derivations exist:
//! - bootstrap: `SHA-256(conversation_id || BOOTSTRAP_DOMAIN_SEPARATOR)`.
//!   Needs no exchange, so both participants always agree on it. It hides
//!   content from passive observers only; anyone who knows the conversation
//!   id and this constant can recompute it.
//! - agreed: `HKDF-SHA256(salt = SHA-256(conversation_id), ikm = X25519 output,
//!   info = AGREED_KEY_INFO)`.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::hash::{sha256, sha256_concat};
use crate::provider::{CryptoError, SymmetricKey, KEY_LEN};

pub const BOOTSTRAP_DOMAIN_SEPARATOR: &[u8] = b"medconnect-chat-key";
pub const AGREED_KEY_INFO: &[u8] = b"MediConnect-E2EE-v3";
const STORAGE_KEY_INFO: &[u8] = b"medc_store_v1:";

/// Deterministic, exchange-free conversation key.
pub fn bootstrap_key(conversation_id: &str) -> SymmetricKey {
    SymmetricKey::from_bytes(sha256_concat(
        conversation_id.as_bytes(),
        BOOTSTRAP_DOMAIN_SEPARATOR,
    ))
}

/// Conversation key from a raw key-agreement secret.
///
/// The conversation id is the HKDF salt, so one pair of identities yields
/// unrelated keys for different conversations.
pub fn agreed_key(shared: &SymmetricKey, conversation_id: &str) -> Result<SymmetricKey, CryptoError> {
    let salt = sha256(conversation_id.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(AGREED_KEY_INFO, okm.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(SymmetricKey::from_bytes(*okm))
}

/// Per-entry key for at-rest encryption, bound to the entry's store path.
///
/// A value copied to another path no longer authenticates.
pub fn storage_subkey(master: &SymmetricKey, path: &str) -> Result<SymmetricKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut info = Vec::with_capacity(STORAGE_KEY_INFO.len() + path.len());
    info.extend_from_slice(STORAGE_KEY_INFO);
    info.extend_from_slice(path.as_bytes());

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, okm.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(SymmetricKey::from_bytes(*okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_is_deterministic() {
        let a = bootstrap_key("conv-42");
        let b = bootstrap_key("conv-42");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_bootstrap_matches_definition() {
        let mut input = b"conv-42".to_vec();
        input.extend_from_slice(BOOTSTRAP_DOMAIN_SEPARATOR);
        assert_eq!(bootstrap_key("conv-42").as_bytes(), &sha256(&input));
    }

    #[test]
    fn test_bootstrap_differs_per_conversation() {
        assert_ne!(bootstrap_key("conv-1"), bootstrap_key("conv-2"));
    }

    #[test]
    fn test_agreed_key_bound_to_conversation() {
        let shared = SymmetricKey::from_bytes([0x11u8; 32]);
        let k1 = agreed_key(&shared, "conv-1").unwrap();
        let k2 = agreed_key(&shared, "conv-2").unwrap();
        let k1_again = agreed_key(&shared, "conv-1").unwrap();

        assert_ne!(k1, k2);
        assert_eq!(k1, k1_again);
        assert_ne!(k1.as_bytes(), shared.as_bytes());
    }

    #[test]
    fn test_agreed_differs_from_bootstrap() {
        let shared = SymmetricKey::from_bytes([0x11u8; 32]);
        assert_ne!(agreed_key(&shared, "conv-42").unwrap(), bootstrap_key("conv-42"));
    }

    #[test]
    fn test_storage_subkey_bound_to_path() {
        let master = SymmetricKey::from_bytes([0x33u8; 32]);
        let a = storage_subkey(&master, "medc/alice/identity").unwrap();
        let b = storage_subkey(&master, "medc/bob/identity").unwrap();

        assert_ne!(a, b);
        assert_eq!(a, storage_subkey(&master, "medc/alice/identity").unwrap());
    }
}
