//! Public key directory.
//!
//! The directory is an external collaborator that stores each user's
//! `PeerKeys` so a counterpart can fetch them before the first message.
//! Only public halves ever go through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medc_crypto::PeerKeys;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone)]
pub enum DirectoryError {
    #[error("http error: {0}")]
    Http(String),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key bundle for {user}: {reason}")]
    InvalidKeys { user: String, reason: String },
}

/// Body of `PUT {base}/public-keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub user_id: String,
    pub public_keys: PeerKeys,
}

/// Body of `GET {base}/public-keys/{userId}`: either the wrapped form or the
/// bare bundle set.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FetchResponse {
    Wrapped(PublishRequest),
    Bare(PeerKeys),
}

impl FetchResponse {
    pub fn into_keys(self) -> PeerKeys {
        match self {
            FetchResponse::Wrapped(req) => req.public_keys,
            FetchResponse::Bare(keys) => keys,
        }
    }
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish (or replace) the local user's public keys.
    async fn publish(&self, user_id: &str, keys: &PeerKeys) -> Result<(), DirectoryError>;

    /// Fetch a user's public keys. `Ok(None)` if the user never published.
    async fn fetch(&self, user_id: &str) -> Result<Option<PeerKeys>, DirectoryError>;
}

/// In-process directory shared by every participant in a test or demo.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    entries: Arc<RwLock<HashMap<String, PeerKeys>>>,
    offline: Arc<AtomicBool>,
    fetch_delay_ms: Arc<AtomicU64>,
    fetches: Arc<AtomicUsize>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every fetch, to exercise caller timeouts.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.entries.read().await.contains_key(user_id)
    }

    fn check_online(&self) -> Result<(), DirectoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn publish(&self, user_id: &str, keys: &PeerKeys) -> Result<(), DirectoryError> {
        self.check_online()?;
        keys.validate().map_err(|e| DirectoryError::InvalidKeys {
            user: user_id.to_string(),
            reason: e.to_string(),
        })?;
        self.entries
            .write()
            .await
            .insert(user_id.to_string(), keys.clone());
        Ok(())
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<PeerKeys>, DirectoryError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_online()?;
        Ok(self.entries.read().await.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medc_crypto::{Algorithm, PublicKeyBundle};

    fn keys(b: u8) -> PeerKeys {
        PeerKeys {
            agreement: PublicKeyBundle::new(Algorithm::X25519, vec![b; 32]),
            encryption: None,
        }
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let dir = InMemoryDirectory::new();
        dir.publish("dr-lee", &keys(1)).await.unwrap();

        assert_eq!(dir.fetch("dr-lee").await.unwrap(), Some(keys(1)));
        assert_eq!(dir.fetch("nobody").await.unwrap(), None);
        assert_eq!(dir.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_directory_errors() {
        let dir = InMemoryDirectory::new();
        dir.set_offline(true);

        assert!(matches!(
            dir.publish("a", &keys(1)).await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(dir.fetch("a").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_bundle_rejected() {
        let dir = InMemoryDirectory::new();
        let bad = PeerKeys {
            agreement: PublicKeyBundle::new(Algorithm::X25519, vec![1; 5]),
            encryption: None,
        };
        assert!(matches!(
            dir.publish("a", &bad).await,
            Err(DirectoryError::InvalidKeys { .. })
        ));
    }

    #[test]
    fn test_publish_request_wire_shape() {
        let req = PublishRequest {
            user_id: "patient-7".to_string(),
            public_keys: keys(2),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["userId"], "patient-7");
        assert_eq!(json["publicKeys"]["agreement"]["algorithm"], "X25519");
    }

    #[test]
    fn test_fetch_response_accepts_both_shapes() {
        let wrapped = serde_json::json!({ "userId": "a", "publicKeys": keys(3) });
        let bare = serde_json::to_value(keys(3)).unwrap();

        let a: FetchResponse = serde_json::from_value(wrapped).unwrap();
        let b: FetchResponse = serde_json::from_value(bare).unwrap();
        assert_eq!(a.into_keys(), keys(3));
        assert_eq!(b.into_keys(), keys(3));
    }
}
