#![forbid(unsafe_code)]

pub mod hash;
pub mod bundle;
pub mod provider;
pub mod kdf;

pub mod envelope;
pub mod legacy;
pub mod seal;
pub mod identity;

pub use bundle::{Algorithm, PeerKeys, PublicKeyBundle};
pub use envelope::EncryptedEnvelope;
pub use provider::{CryptoError, CryptoProvider, DalekProvider, Keypair, PeerPublicKey, SymmetricKey};

#[cfg(test)]
mod proptests;
