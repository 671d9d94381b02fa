//! MediConnect core - end-to-end message encryption for patient/doctor chat.
//!
//! This crate implements:
//! - Identity key management (generate, persist, rotate)
//! - Public key exchange through a key directory and in-band messages
//! - Per-conversation key derivation with versioned keyrings
//! - Message encryption and tolerant decryption
//! - Persistent key storage abstraction
//!
//! `MessageEncryption` in [`service`] is the entry point for the chat layer.

#![forbid(unsafe_code)]

// Key lifecycle
pub mod identity;
pub mod exchange;
pub mod conversation;

// Services
pub mod cipher;
pub mod service;

// Infrastructure
pub mod store;
pub mod sealed_store;
pub mod directory;

// Supporting modules
pub mod errors;
pub mod config;
pub mod harness;

// Optional directory client
pub mod http_directory;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use cipher::{DecryptOutcome, Decrypted};
pub use config::{ConfigError, EncryptionConfig};
pub use conversation::{ConversationStatus, DerivationMethod};
pub use directory::{DirectoryError, InMemoryDirectory, KeyDirectory};
pub use errors::{CoreError, ErrorCode};
pub use exchange::{HandshakeState, KeyExchangeMessage};
pub use service::{EncryptionStatus, MessageEncryption};
pub use store::{InMemoryKeyStore, KeyStore, StoreError};
