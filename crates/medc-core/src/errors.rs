//! Error types for the encryption core.
//!
//! Each concern has its own error enum; `CoreError` aggregates them and
//! classifies which failures are fatal and which only degrade the session
//! (bootstrap fallback, legacy passthrough, in-memory-only keys).

use medc_crypto::envelope::EnvelopeError;
use medc_crypto::identity::IdentityError;
use medc_crypto::CryptoError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::exchange::ExchangeError;
use crate::store::StoreError;

// ============================================================================
// Unified Core Error
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// Identity key generation failed. Fatal, never retried.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Counterpart public keys are not known. Callers fall back to bootstrap.
    #[error("public keys unavailable for {0}")]
    PeerKeyUnavailable(String),

    /// AEAD tag did not verify under any known key version.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Payload is not a well-formed envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ExchangeError),
}

/// Coarse error category for callers that render status to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    KeyUnavailable,
    IntegrityFailure,
    StorageFailure,
    DirectoryFailure,
    ConfigInvalid,
    ProtocolViolation,
    Internal,
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyGeneration(msg) => CoreError::KeyGeneration(msg),
            CryptoError::AuthenticationFailed => CoreError::AuthenticationFailure,
            other => CoreError::Crypto(other),
        }
    }
}

impl From<IdentityError> for CoreError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Crypto(c) => c.into(),
            other => CoreError::Persistence(StoreError::DataCorruption(other.to_string())),
        }
    }
}

impl CoreError {
    /// Map to a wire-safe code and message that never includes key paths,
    /// user ids or crypto internals.
    pub fn to_wire_safe(&self) -> (ErrorCode, String) {
        match self {
            CoreError::KeyGeneration(_) => (
                ErrorCode::Internal,
                "Encryption keys could not be created".to_string(),
            ),
            CoreError::PeerKeyUnavailable(_) => (
                ErrorCode::KeyUnavailable,
                "Counterpart keys are not available yet".to_string(),
            ),
            CoreError::AuthenticationFailure | CoreError::MalformedEnvelope(_) => (
                ErrorCode::IntegrityFailure,
                "Message could not be decrypted".to_string(),
            ),
            CoreError::Persistence(_) => (
                ErrorCode::StorageFailure,
                "Key storage failed".to_string(),
            ),
            CoreError::Directory(_) => (
                ErrorCode::DirectoryFailure,
                "Key directory unavailable".to_string(),
            ),
            CoreError::Crypto(_) => (ErrorCode::Internal, "Encryption failed".to_string()),
            CoreError::Config(_) => (
                ErrorCode::ConfigInvalid,
                "Invalid encryption configuration".to_string(),
            ),
            CoreError::Protocol(_) => (
                ErrorCode::ProtocolViolation,
                "Invalid key exchange message".to_string(),
            ),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.to_wire_safe().0
    }

    /// Errors that abort the operation rather than degrade it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::KeyGeneration(_)
                | CoreError::Persistence(_)
                | CoreError::Crypto(_)
                | CoreError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_mapping() {
        assert!(matches!(
            CoreError::from(CryptoError::AuthenticationFailed),
            CoreError::AuthenticationFailure
        ));
        assert!(matches!(
            CoreError::from(CryptoError::KeyGeneration("no entropy".into())),
            CoreError::KeyGeneration(_)
        ));
        assert!(matches!(
            CoreError::from(CryptoError::InvalidPublicKey),
            CoreError::Crypto(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_store_error_hides_details() {
        let err = CoreError::from(StoreError::OperationFailed(
            "failed to save medc/dr-lee/identity".to_string(),
        ));
        let (code, message) = err.to_wire_safe();
        assert_eq!(code, ErrorCode::StorageFailure);
        assert!(!message.contains("dr-lee"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_degrading_errors_are_not_fatal() {
        assert!(!CoreError::PeerKeyUnavailable("p".into()).is_fatal());
        assert!(!CoreError::AuthenticationFailure.is_fatal());
        assert!(!CoreError::Directory(DirectoryError::Unavailable("x".into())).is_fatal());
    }

    #[test]
    fn test_envelope_error_is_integrity_failure() {
        let err = CoreError::from(EnvelopeError::NotBase64);
        assert_eq!(err.error_code(), ErrorCode::IntegrityFailure);
    }

    #[test]
    fn test_corrupt_identity_is_persistence() {
        let err = CoreError::from(IdentityError::InvalidEncoding);
        assert!(matches!(err, CoreError::Persistence(StoreError::DataCorruption(_))));
    }
}
