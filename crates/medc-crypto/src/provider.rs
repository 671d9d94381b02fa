//! Cryptographic provider.
//!
//! `CryptoProvider` is the capability surface the protocol code uses for key
//! generation, key agreement, AEAD and randomness. Every operation is a pure
//! function of its explicit inputs. `DalekProvider` implements it with
//! X25519 and ChaCha20Poly1305.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::{Algorithm, PublicKeyBundle, PUBLIC_KEY_LEN};
use crate::hash;

/// Symmetric key size (ChaCha20Poly1305).
pub const KEY_LEN: usize = 32;
/// AEAD nonce size.
pub const NONCE_LEN: usize = 12;
/// AEAD authentication tag size.
pub const TAG_LEN: usize = 16;

/// Error type for provider operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("algorithm mismatch: {local} cannot be combined with {peer}")]
    AlgorithmMismatch { local: Algorithm, peer: Algorithm },
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("RNG failed")]
    RngError,
}

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A local X25519 keypair tagged with its purpose.
///
/// The private half is only reachable through `secret_bytes`, which hands out
/// a zeroizing copy for persistence.
#[derive(Clone)]
pub struct Keypair {
    algorithm: Algorithm,
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl Keypair {
    /// Rebuild a keypair from persisted private key bytes.
    pub fn from_secret_bytes(algorithm: Algorithm, secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = X25519PublicKey::from(&secret);
        Self {
            algorithm,
            secret,
            public,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public_bundle(&self) -> PublicKeyBundle {
        PublicKeyBundle::new(self.algorithm, self.public_bytes().to_vec())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("algorithm", &self.algorithm)
            .field("public", &hash::fingerprint(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// An imported counterpart public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey {
    algorithm: Algorithm,
    key: X25519PublicKey,
}

impl PeerPublicKey {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.key.as_bytes()
    }

    pub(crate) fn key(&self) -> &X25519PublicKey {
        &self.key
    }
}

/// Capability surface over the platform's AEAD and key-agreement primitives.
pub trait CryptoProvider: Send + Sync {
    /// Generate a static key-agreement keypair.
    fn generate_agreement_keypair(&self) -> Result<Keypair, CryptoError>;

    /// Generate a sealing keypair used for key wrapping.
    fn generate_encryption_keypair(&self) -> Result<Keypair, CryptoError>;

    /// Export the raw public key bytes of a local keypair.
    fn export_public_key(&self, keypair: &Keypair) -> Vec<u8> {
        keypair.public_bytes().to_vec()
    }

    /// Import a counterpart's raw public key.
    fn import_public_key(
        &self,
        bytes: &[u8],
        algorithm: Algorithm,
    ) -> Result<PeerPublicKey, CryptoError>;

    /// Raw Diffie-Hellman output between a local private key and a peer key.
    ///
    /// Callers must run the result through a KDF before using it as a
    /// conversation key.
    fn derive_shared_key(
        &self,
        private: &Keypair,
        peer: &PeerPublicKey,
    ) -> Result<SymmetricKey, CryptoError>;

    /// Encrypt and authenticate. Output is ciphertext || tag.
    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify and decrypt ciphertext || tag.
    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError>;

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        hash::sha256(data)
    }

    fn nonce_len(&self) -> usize {
        NONCE_LEN
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }
}

/// Default provider: X25519 (x25519-dalek) + ChaCha20Poly1305, OS randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct DalekProvider;

impl DalekProvider {
    pub fn new() -> Self {
        Self
    }

    fn generate_keypair(algorithm: Algorithm) -> Result<Keypair, CryptoError> {
        let mut secret = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut secret[..])
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Keypair::from_secret_bytes(algorithm, *secret))
    }

    fn cipher(key: &SymmetricKey) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
    }

    fn check_nonce(nonce: &[u8]) -> Result<(), CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_LEN,
                got: nonce.len(),
            });
        }
        Ok(())
    }
}

impl CryptoProvider for DalekProvider {
    fn generate_agreement_keypair(&self) -> Result<Keypair, CryptoError> {
        Self::generate_keypair(Algorithm::X25519)
    }

    fn generate_encryption_keypair(&self) -> Result<Keypair, CryptoError> {
        Self::generate_keypair(Algorithm::X25519Seal)
    }

    fn import_public_key(
        &self,
        bytes: &[u8],
        algorithm: Algorithm,
    ) -> Result<PeerPublicKey, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: bytes.len(),
            })?;
        Ok(PeerPublicKey {
            algorithm,
            key: X25519PublicKey::from(arr),
        })
    }

    fn derive_shared_key(
        &self,
        private: &Keypair,
        peer: &PeerPublicKey,
    ) -> Result<SymmetricKey, CryptoError> {
        if private.algorithm() != peer.algorithm() {
            return Err(CryptoError::AlgorithmMismatch {
                local: private.algorithm(),
                peer: peer.algorithm(),
            });
        }
        let shared = private.secret().diffie_hellman(peer.key());
        // Low-order peer points give an all-zero secret.
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(SymmetricKey::from_bytes(shared.to_bytes()))
    }

    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Self::check_nonce(nonce)?;
        Self::cipher(key)
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Self::check_nonce(nonce)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        Self::cipher(key)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; len];
        getrandom::getrandom(&mut out).map_err(|_| CryptoError::RngError)?;
        Ok(out)
    }
}
