//! Message encryption and decryption.
//!
//! `MessageCipher` turns plaintext into wire payloads under a conversation
//! key and back. Decryption never fails loudly on bad input: anything that is
//! not ciphertext is passed through as historical plaintext, and ciphertext
//! that no known key opens is returned unchanged and flagged.

use std::sync::Arc;

use medc_crypto::kdf::bootstrap_key;
use medc_crypto::legacy::{classify, PayloadKind};
use medc_crypto::{CryptoProvider, EncryptedEnvelope, SymmetricKey};
use serde::Serialize;
use tracing::{debug, warn};

use crate::conversation::{ConversationKeyRecord, ConversationKeyring, DerivationMethod};
use crate::errors::CoreError;

/// How an inbound payload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecryptOutcome {
    /// Opened with the keyring record of this version.
    Decrypted { version: u32, method: DerivationMethod },
    /// Opened with the bootstrap key although the keyring never held it
    /// (the sender had not learned our keys yet).
    BootstrapFallback,
    /// The empty-message sentinel.
    Empty,
    /// Not ciphertext; returned as-is.
    LegacyPlaintext,
    /// Looked like ciphertext but no key authenticated it; returned as-is.
    Undecryptable,
}

impl DecryptOutcome {
    pub fn is_decrypted(&self) -> bool {
        matches!(
            self,
            DecryptOutcome::Decrypted { .. } | DecryptOutcome::BootstrapFallback | DecryptOutcome::Empty
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub text: String,
    pub outcome: DecryptOutcome,
}

impl Decrypted {
    fn passthrough(payload: &str, outcome: DecryptOutcome) -> Self {
        Self {
            text: payload.to_string(),
            outcome,
        }
    }
}

pub struct MessageCipher {
    provider: Arc<dyn CryptoProvider>,
}

impl MessageCipher {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Encrypt under `record` with a fresh random nonce.
    pub fn seal(
        &self,
        record: &ConversationKeyRecord,
        plaintext: &str,
    ) -> Result<EncryptedEnvelope, CoreError> {
        if plaintext.is_empty() {
            return Ok(EncryptedEnvelope::Empty);
        }
        let nonce = self.provider.random_bytes(self.provider.nonce_len())?;
        let ciphertext = self
            .provider
            .aead_encrypt(&record.key, &nonce, plaintext.as_bytes())?;
        Ok(EncryptedEnvelope::sealed(nonce, ciphertext)?)
    }

    /// Classify and decrypt an inbound payload.
    ///
    /// `keyring` is `None` when no key could be resolved; ciphertext is then
    /// reported as undecryptable. `bootstrap_fallback` also tries the
    /// conversation's bootstrap key when the keyring does not hold it.
    pub fn decrypt_payload(
        &self,
        conversation_id: &str,
        keyring: Option<&ConversationKeyring>,
        payload: &str,
        bootstrap_fallback: bool,
    ) -> Decrypted {
        let envelope = match classify(payload) {
            PayloadKind::Empty => return Decrypted::passthrough("", DecryptOutcome::Empty),
            PayloadKind::Plaintext(reason) => {
                debug!(conversation = %conversation_id, reason = ?reason, "Treating payload as legacy plaintext");
                return Decrypted::passthrough(payload, DecryptOutcome::LegacyPlaintext);
            }
            PayloadKind::Ciphertext(envelope) => envelope,
        };

        if let Some(keyring) = keyring {
            for record in keyring.by_recency() {
                if let Some(text) = self.try_open(&record.key, &envelope) {
                    return Decrypted {
                        text,
                        outcome: DecryptOutcome::Decrypted {
                            version: record.version,
                            method: record.method,
                        },
                    };
                }
            }
        }

        let holds_bootstrap = keyring
            .map(|k| k.by_recency().any(|r| r.method == DerivationMethod::Bootstrap))
            .unwrap_or(false);
        if bootstrap_fallback && !holds_bootstrap {
            if let Some(text) = self.try_open(&bootstrap_key(conversation_id), &envelope) {
                debug!(conversation = %conversation_id, "Opened message with bootstrap fallback");
                return Decrypted {
                    text,
                    outcome: DecryptOutcome::BootstrapFallback,
                };
            }
        }

        warn!(
            conversation = %conversation_id,
            versions = keyring.map(|k| k.len()).unwrap_or(0),
            "No key authenticated the message, passing it through"
        );
        Decrypted::passthrough(payload, DecryptOutcome::Undecryptable)
    }

    /// Invalid UTF-8 counts as a failure.
    fn try_open(&self, key: &SymmetricKey, envelope: &EncryptedEnvelope) -> Option<String> {
        let (nonce, ciphertext) = match (envelope.nonce(), envelope.ciphertext()) {
            (Some(n), Some(c)) => (n, c),
            _ => return Some(String::new()),
        };
        let plaintext = self.provider.aead_decrypt(key, nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medc_crypto::DalekProvider;

    fn record(version: u32, method: DerivationMethod, key: SymmetricKey) -> ConversationKeyRecord {
        ConversationKeyRecord {
            conversation_id: "conv-42".to_string(),
            key,
            method,
            version,
            created_at: 0,
        }
    }

    fn cipher() -> MessageCipher {
        MessageCipher::new(Arc::new(DalekProvider::new()))
    }

    #[test]
    fn test_round_trip_active_key() {
        let c = cipher();
        let keyring = ConversationKeyring::new(record(
            1,
            DerivationMethod::Agreed,
            SymmetricKey::from_bytes([7; 32]),
        ));

        let payload = c.seal(keyring.active(), "Hello, Doctor").unwrap().to_payload();
        let out = c.decrypt_payload("conv-42", Some(&keyring), &payload, true);

        assert_eq!(out.text, "Hello, Doctor");
        assert_eq!(
            out.outcome,
            DecryptOutcome::Decrypted { version: 1, method: DerivationMethod::Agreed }
        );
    }

    #[test]
    fn test_older_version_still_opens() {
        let c = cipher();
        let old = record(1, DerivationMethod::Bootstrap, bootstrap_key("conv-42"));
        let payload = c.seal(&old, "sent before upgrade").unwrap().to_payload();

        let mut keyring = ConversationKeyring::new(old);
        keyring.push(record(2, DerivationMethod::Agreed, SymmetricKey::from_bytes([9; 32])));

        let out = c.decrypt_payload("conv-42", Some(&keyring), &payload, true);
        assert_eq!(out.text, "sent before upgrade");
        assert_eq!(
            out.outcome,
            DecryptOutcome::Decrypted { version: 1, method: DerivationMethod::Bootstrap }
        );
    }

    #[test]
    fn test_bootstrap_fallback_when_keyring_lacks_it() {
        let c = cipher();
        let sender = record(1, DerivationMethod::Bootstrap, bootstrap_key("conv-42"));
        let payload = c.seal(&sender, "hi").unwrap().to_payload();

        let receiver = ConversationKeyring::new(record(
            1,
            DerivationMethod::Agreed,
            SymmetricKey::from_bytes([3; 32]),
        ));
        let out = c.decrypt_payload("conv-42", Some(&receiver), &payload, true);
        assert_eq!(out.text, "hi");
        assert_eq!(out.outcome, DecryptOutcome::BootstrapFallback);

        let strict = c.decrypt_payload("conv-42", Some(&receiver), &payload, false);
        assert_eq!(strict.outcome, DecryptOutcome::Undecryptable);
        assert_eq!(strict.text, payload);
    }

    #[test]
    fn test_empty_message_has_no_nonce() {
        let c = cipher();
        let r = record(1, DerivationMethod::Agreed, SymmetricKey::from_bytes([1; 32]));
        let env = c.seal(&r, "").unwrap();

        assert_eq!(env, EncryptedEnvelope::Empty);
        let out = c.decrypt_payload("conv-42", None, &env.to_payload(), true);
        assert_eq!(out, Decrypted { text: String::new(), outcome: DecryptOutcome::Empty });
    }

    #[test]
    fn test_legacy_plaintext_passthrough() {
        let out = cipher().decrypt_payload("conv-42", None, "plain unencrypted text", true);
        assert_eq!(out.text, "plain unencrypted text");
        assert_eq!(out.outcome, DecryptOutcome::LegacyPlaintext);
    }

    #[test]
    fn test_nonces_differ_per_message() {
        let c = cipher();
        let r = record(1, DerivationMethod::Agreed, SymmetricKey::from_bytes([1; 32]));
        let a = c.seal(&r, "same").unwrap();
        let b = c.seal(&r, "same").unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.to_payload(), b.to_payload());
    }
}
