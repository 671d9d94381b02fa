//! Key wrapping for out-of-band transfer.
//! Implements a sealed box using X25519 + HKDF + ChaCha20Poly1305 against a
//! recipient's sealing (`X25519-SEAL`) public key.
//!
//! Layout: `ephemeral_pub(32) || nonce(12) || ciphertext+tag`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::bundle::{Algorithm, PUBLIC_KEY_LEN};
use crate::provider::{CryptoError, Keypair, PeerPublicKey, SymmetricKey, KEY_LEN, NONCE_LEN, TAG_LEN};

const WRAP_INFO: &[u8] = b"medc_wrap_v1_key";

/// A symmetric key sealed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ephemeral_pub: [u8; PUBLIC_KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl WrappedKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral_pub);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_LEN + NONCE_LEN + KEY_LEN + TAG_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN + NONCE_LEN + KEY_LEN + TAG_LEN,
                got: bytes.len(),
            });
        }
        let (eph, rest) = bytes.split_at(PUBLIC_KEY_LEN);
        let (nonce, ct) = rest.split_at(NONCE_LEN);

        let mut ephemeral_pub = [0u8; PUBLIC_KEY_LEN];
        ephemeral_pub.copy_from_slice(eph);
        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);

        Ok(Self {
            ephemeral_pub,
            nonce: n,
            ciphertext: ct.to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s.as_bytes())
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Self::from_bytes(&bytes)
    }
}

fn wrap_cipher(shared: &[u8; 32], eph_pub: &[u8], recipient_pub: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
    // Bind the derived key to both public keys.
    let mut salt = Vec::with_capacity(eph_pub.len() + recipient_pub.len());
    salt.extend_from_slice(eph_pub);
    salt.extend_from_slice(recipient_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(WRAP_INFO, key.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_slice())))
}

/// Seal `key` to `recipient`. `context` is authenticated but not encrypted
/// (use the conversation id).
pub fn wrap_key(
    recipient: &PeerPublicKey,
    key: &SymmetricKey,
    context: &[u8],
) -> Result<WrappedKey, CryptoError> {
    if recipient.algorithm() != Algorithm::X25519Seal {
        return Err(CryptoError::AlgorithmMismatch {
            local: Algorithm::X25519Seal,
            peer: recipient.algorithm(),
        });
    }

    let mut eph_bytes = Zeroizing::new([0u8; 32]);
    getrandom::getrandom(&mut eph_bytes[..]).map_err(|_| CryptoError::RngError)?;
    let eph = StaticSecret::from(*eph_bytes);
    let eph_pub = X25519PublicKey::from(&eph);

    let shared = eph.diffie_hellman(recipient.key());
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::RngError)?;

    let cipher = wrap_cipher(shared.as_bytes(), eph_pub.as_bytes(), recipient.as_bytes())?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: key.as_bytes(),
                aad: context,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(WrappedKey {
        ephemeral_pub: eph_pub.to_bytes(),
        nonce,
        ciphertext,
    })
}

/// Open a key sealed to our sealing keypair.
pub fn unwrap_key(
    recipient: &Keypair,
    wrapped: &WrappedKey,
    context: &[u8],
) -> Result<SymmetricKey, CryptoError> {
    if recipient.algorithm() != Algorithm::X25519Seal {
        return Err(CryptoError::AlgorithmMismatch {
            local: recipient.algorithm(),
            peer: Algorithm::X25519Seal,
        });
    }

    let eph_pub = X25519PublicKey::from(wrapped.ephemeral_pub);
    let shared = recipient.secret().diffie_hellman(&eph_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let cipher = wrap_cipher(
        shared.as_bytes(),
        &wrapped.ephemeral_pub,
        &recipient.public_bytes(),
    )?;
    let pt = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&wrapped.nonce),
                Payload {
                    msg: &wrapped.ciphertext,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?,
    );
    SymmetricKey::from_slice(&pt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CryptoProvider, DalekProvider};

    fn recipient() -> (Keypair, PeerPublicKey) {
        let p = DalekProvider::new();
        let kp = p.generate_encryption_keypair().unwrap();
        let public = p
            .import_public_key(&kp.public_bytes(), Algorithm::X25519Seal)
            .unwrap();
        (kp, public)
    }

    #[test]
    fn test_wrap_round_trip() {
        let (kp, public) = recipient();
        let key = SymmetricKey::from_bytes([0x5Au8; 32]);

        let wrapped = wrap_key(&public, &key, b"conv-42").unwrap();
        let restored = WrappedKey::from_base64(&wrapped.to_base64()).unwrap();

        assert_eq!(unwrap_key(&kp, &restored, b"conv-42").unwrap(), key);
    }

    #[test]
    fn test_wrong_context_fails() {
        let (kp, public) = recipient();
        let key = SymmetricKey::from_bytes([0x5Au8; 32]);

        let wrapped = wrap_key(&public, &key, b"conv-42").unwrap();
        assert_eq!(
            unwrap_key(&kp, &wrapped, b"conv-43"),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let (_, public) = recipient();
        let (other, _) = recipient();
        let key = SymmetricKey::from_bytes([0x5Au8; 32]);

        let wrapped = wrap_key(&public, &key, b"ctx").unwrap();
        assert!(unwrap_key(&other, &wrapped, b"ctx").is_err());
    }

    #[test]
    fn test_agreement_key_cannot_receive_wraps() {
        let p = DalekProvider::new();
        let agreement = p.generate_agreement_keypair().unwrap();
        let public = p
            .import_public_key(&agreement.public_bytes(), Algorithm::X25519)
            .unwrap();

        assert!(matches!(
            wrap_key(&public, &SymmetricKey::from_bytes([0u8; 32]), b""),
            Err(CryptoError::AlgorithmMismatch { .. })
        ));
    }
}
