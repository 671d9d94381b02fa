use proptest::prelude::*;

use crate::envelope::EncryptedEnvelope;
use crate::kdf::{agreed_key, bootstrap_key};
use crate::legacy::{classify, PayloadKind};
use crate::provider::{CryptoProvider, DalekProvider, SymmetricKey, NONCE_LEN};

proptest! {
    // Any plaintext survives seal -> wire -> classify -> open.
    #[test]
    fn test_seal_open_round_trip(
        key in any::<[u8; 32]>(),
        plaintext in ".{1,200}",
    ) {
        let p = DalekProvider::new();
        let key = SymmetricKey::from_bytes(key);
        let nonce = p.random_bytes(NONCE_LEN).unwrap();
        let ct = p.aead_encrypt(&key, &nonce, plaintext.as_bytes()).unwrap();
        let payload = EncryptedEnvelope::sealed(nonce, ct).unwrap().to_payload();

        let env = match classify(&payload) {
            PayloadKind::Ciphertext(env) => env,
            other => return Err(TestCaseError::fail(format!("classified as {:?}", other))),
        };
        let pt = p
            .aead_decrypt(&key, env.nonce().unwrap(), env.ciphertext().unwrap())
            .unwrap();
        prop_assert_eq!(pt, plaintext.as_bytes());
    }

    #[test]
    fn test_bootstrap_determinism(conv in "[a-zA-Z0-9_-]{1,40}") {
        prop_assert_eq!(bootstrap_key(&conv), bootstrap_key(&conv));
    }

    // Flipping any single bit of nonce or ciphertext breaks authentication.
    #[test]
    fn test_tamper_detection(
        plaintext in any::<Vec<u8>>(),
        flip in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let p = DalekProvider::new();
        let key = SymmetricKey::from_bytes([0x42u8; 32]);
        let nonce = p.random_bytes(NONCE_LEN).unwrap();
        let ct = p.aead_encrypt(&key, &nonce, &plaintext).unwrap();

        let mut wire = EncryptedEnvelope::sealed(nonce, ct).unwrap().to_bytes();
        let i = flip.index(wire.len());
        wire[i] ^= 1 << bit;

        let env = EncryptedEnvelope::from_bytes(&wire).unwrap();
        prop_assert!(p
            .aead_decrypt(&key, env.nonce().unwrap(), env.ciphertext().unwrap())
            .is_err());
    }

    // Both sides of an agreement land on the same conversation key.
    #[test]
    fn test_agreed_key_symmetry(conv in "[a-z0-9-]{1,32}") {
        let p = DalekProvider::new();
        let alice = p.generate_agreement_keypair().unwrap();
        let bob = p.generate_agreement_keypair().unwrap();
        let alice_pub = p.import_public_key(&alice.public_bytes(), alice.algorithm()).unwrap();
        let bob_pub = p.import_public_key(&bob.public_bytes(), bob.algorithm()).unwrap();

        let ka = agreed_key(&p.derive_shared_key(&alice, &bob_pub).unwrap(), &conv).unwrap();
        let kb = agreed_key(&p.derive_shared_key(&bob, &alice_pub).unwrap(), &conv).unwrap();
        prop_assert_eq!(ka, kb);
    }

    // Short printable text is never mistaken for ciphertext.
    #[test]
    fn test_short_text_is_plaintext(text in "[ -~]{1,37}") {
        prop_assert!(!matches!(classify(&text), PayloadKind::Ciphertext(_)));
    }
}
