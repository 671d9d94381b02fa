//! Public key exchange.
//!
//! Per counterpart, the handshake moves through
//! `Uninitiated -> LocalPublished -> PeerKnown -> Established`:
//!
//! - local `PeerKeys` pushed to the directory: `LocalPublished`
//! - counterpart keys fetched from the directory or received in a
//!   `KeyExchangeMessage`: `PeerKnown` (the keys are persisted)
//! - an agreed conversation key derived from them: `Established`
//!
//! A missing, failing or slow directory never blocks the caller. The state
//! simply stays where it was and the deriver uses the bootstrap key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use medc_crypto::PeerKeys;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::directory::KeyDirectory;
use crate::errors::CoreError;
use crate::identity::IdentityKeyManager;
use crate::store::{KeySpace, KeyStore, StoreError};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HandshakeState {
    Uninitiated,
    LocalPublished,
    PeerKnown,
    Established,
}

#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("message addressed to {to}, local user is {local}")]
    Misaddressed { to: String, local: String },
    #[error("key exchange with self")]
    SelfExchange,
    #[error("invalid public keys from {from}: {reason}")]
    InvalidKeys { from: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeAction {
    #[serde(rename = "key_exchange")]
    Offer,
    #[serde(rename = "key_exchange_ack")]
    Ack,
}

/// In-band key exchange message, relayed by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeMessage {
    pub action: ExchangeAction,
    pub from: String,
    pub to: String,
    pub public_keys: PeerKeys,
}

// ============================================================================
// Key exchange
// ============================================================================

pub struct KeyExchange {
    space: KeySpace,
    identity: Arc<IdentityKeyManager>,
    directory: Arc<dyn KeyDirectory>,
    store: Arc<dyn KeyStore>,
    fetch_timeout: Duration,
    states: RwLock<HashMap<String, HandshakeState>>,
    peers: RwLock<HashMap<String, PeerKeys>>,
}

impl KeyExchange {
    pub fn new(
        space: KeySpace,
        identity: Arc<IdentityKeyManager>,
        directory: Arc<dyn KeyDirectory>,
        store: Arc<dyn KeyStore>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            space,
            identity,
            directory,
            store,
            fetch_timeout,
            states: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state(&self, counterpart: &str) -> HandshakeState {
        self.states
            .read()
            .await
            .get(counterpart)
            .copied()
            .unwrap_or(HandshakeState::Uninitiated)
    }

    /// Publish local keys and try to learn the counterpart's.
    ///
    /// Only identity failures are returned. Directory problems are logged and
    /// leave the state short of `PeerKnown`.
    pub async fn start(&self, counterpart: &str) -> Result<HandshakeState, CoreError> {
        if counterpart == self.space.user_id() {
            return Err(ExchangeError::SelfExchange.into());
        }

        match self.publish_local().await {
            Ok(()) => self.advance(counterpart, HandshakeState::LocalPublished).await,
            Err(e) => warn!(counterpart = %counterpart, error = %e, "Failed to publish local keys"),
        }

        match self.fetch_with_timeout(counterpart).await {
            Ok(Some(keys)) => {
                if let Err(e) = self.accept_peer_keys(counterpart, keys).await {
                    warn!(counterpart = %counterpart, error = %e, "Directory returned unusable keys");
                }
            }
            Ok(None) => {
                // Fall back to a previously persisted copy.
                if self.peer_keys(counterpart).await?.is_none() {
                    debug!(counterpart = %counterpart, "Counterpart has not published keys");
                }
            }
            Err(e) => {
                warn!(counterpart = %counterpart, error = %e, "Counterpart keys unavailable, using fallback");
                self.peer_keys(counterpart).await?;
            }
        }

        Ok(self.state(counterpart).await)
    }

    /// Push the local `PeerKeys` to the directory.
    pub async fn publish_local(&self) -> Result<(), CoreError> {
        let keys = self.identity.local_public_keys().await?;
        match tokio::time::timeout(
            self.fetch_timeout,
            self.directory.publish(self.space.user_id(), &keys),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(CoreError::Directory(
                    crate::directory::DirectoryError::Unavailable("publish timed out".to_string()),
                ))
            }
        }
        debug!(
            user = %self.space.user_id(),
            fingerprint = %keys.agreement.fingerprint(),
            "Published local public keys"
        );
        Ok(())
    }

    /// Known keys for a counterpart: memory first, then the persisted cache.
    pub async fn peer_keys(&self, counterpart: &str) -> Result<Option<PeerKeys>, CoreError> {
        if let Some(keys) = self.peers.read().await.get(counterpart) {
            return Ok(Some(keys.clone()));
        }

        let bytes = match self.store.get(&self.space.peer(counterpart)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(counterpart = %counterpart, error = %e, "Failed to read cached peer keys");
                return Ok(None);
            }
        };
        let keys: PeerKeys = match serde_json::from_slice(&bytes) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(counterpart = %counterpart, error = %e, "Ignoring unreadable cached peer keys");
                return Ok(None);
            }
        };
        if keys.validate().is_err() {
            warn!(counterpart = %counterpart, "Ignoring invalid cached peer keys");
            return Ok(None);
        }

        self.peers
            .write()
            .await
            .insert(counterpart.to_string(), keys.clone());
        self.advance(counterpart, HandshakeState::PeerKnown).await;
        Ok(Some(keys))
    }

    /// Record a counterpart's keys and persist them.
    pub async fn accept_peer_keys(&self, counterpart: &str, keys: PeerKeys) -> Result<(), CoreError> {
        keys.validate().map_err(|e| ExchangeError::InvalidKeys {
            from: counterpart.to_string(),
            reason: e.to_string(),
        })?;

        let previous = self
            .peers
            .write()
            .await
            .insert(counterpart.to_string(), keys.clone());

        match previous {
            Some(old) if old != keys => {
                info!(
                    counterpart = %counterpart,
                    fingerprint = %keys.agreement.fingerprint(),
                    "Counterpart keys changed"
                );
                // New keys have not been used for any derivation yet.
                self.states
                    .write()
                    .await
                    .insert(counterpart.to_string(), HandshakeState::PeerKnown);
            }
            Some(_) => {}
            None => {
                debug!(
                    counterpart = %counterpart,
                    fingerprint = %keys.agreement.fingerprint(),
                    "Learned counterpart keys"
                );
            }
        }
        self.advance(counterpart, HandshakeState::PeerKnown).await;

        let encoded = serde_json::to_vec(&keys).map_err(StoreError::from)?;
        if let Err(e) = self.store.set(&self.space.peer(counterpart), encoded).await {
            warn!(counterpart = %counterpart, error = %e, "Failed to persist peer keys, keeping in memory");
        }
        Ok(())
    }

    pub async fn mark_established(&self, counterpart: &str) {
        self.advance(counterpart, HandshakeState::Established).await;
    }

    /// Build an offer carrying the local keys.
    pub async fn offer(&self, counterpart: &str) -> Result<KeyExchangeMessage, CoreError> {
        if counterpart == self.space.user_id() {
            return Err(ExchangeError::SelfExchange.into());
        }
        Ok(KeyExchangeMessage {
            action: ExchangeAction::Offer,
            from: self.space.user_id().to_string(),
            to: counterpart.to_string(),
            public_keys: self.identity.local_public_keys().await?,
        })
    }

    /// Consume an inbound message. Offers are answered with an ack.
    pub async fn handle_message(
        &self,
        msg: KeyExchangeMessage,
    ) -> Result<Option<KeyExchangeMessage>, CoreError> {
        if msg.to != self.space.user_id() {
            return Err(ExchangeError::Misaddressed {
                to: msg.to,
                local: self.space.user_id().to_string(),
            }
            .into());
        }
        if msg.from == self.space.user_id() {
            return Err(ExchangeError::SelfExchange.into());
        }

        self.accept_peer_keys(&msg.from, msg.public_keys).await?;

        match msg.action {
            ExchangeAction::Offer => Ok(Some(KeyExchangeMessage {
                action: ExchangeAction::Ack,
                from: self.space.user_id().to_string(),
                to: msg.from,
                public_keys: self.identity.local_public_keys().await?,
            })),
            ExchangeAction::Ack => Ok(None),
        }
    }

    /// Drop in-memory peer keys and states; persisted keys stay.
    pub async fn evict_cache(&self) {
        self.peers.write().await.clear();
        self.states.write().await.clear();
    }

    async fn fetch_with_timeout(&self, counterpart: &str) -> Result<Option<PeerKeys>, CoreError> {
        match tokio::time::timeout(self.fetch_timeout, self.directory.fetch(counterpart)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoreError::PeerKeyUnavailable(format!(
                "{} (directory timed out after {:?})",
                counterpart, self.fetch_timeout
            ))),
        }
    }

    async fn advance(&self, counterpart: &str, to: HandshakeState) {
        let mut states = self.states.write().await;
        let entry = states
            .entry(counterpart.to_string())
            .or_insert(HandshakeState::Uninitiated);
        if *entry < to {
            *entry = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::store::InMemoryKeyStore;
    use medc_crypto::DalekProvider;

    struct Side {
        exchange: KeyExchange,
        store: Arc<InMemoryKeyStore>,
    }

    fn side(user: &str, dir: &InMemoryDirectory) -> Side {
        let store = Arc::new(InMemoryKeyStore::new());
        let identity = Arc::new(IdentityKeyManager::new(
            KeySpace::new(user),
            store.clone(),
            Arc::new(DalekProvider::new()),
        ));
        Side {
            exchange: KeyExchange::new(
                KeySpace::new(user),
                identity,
                Arc::new(dir.clone()),
                store.clone(),
                Duration::from_millis(200),
            ),
            store,
        }
    }

    #[tokio::test]
    async fn test_start_without_counterpart_stays_published() {
        let dir = InMemoryDirectory::new();
        let patient = side("patient-7", &dir);

        let state = patient.exchange.start("dr-lee").await.unwrap();
        assert_eq!(state, HandshakeState::LocalPublished);
        assert!(dir.contains("patient-7").await);
    }

    #[tokio::test]
    async fn test_start_after_counterpart_published() {
        let dir = InMemoryDirectory::new();
        let patient = side("patient-7", &dir);
        let doctor = side("dr-lee", &dir);

        patient.exchange.start("dr-lee").await.unwrap();
        let state = doctor.exchange.start("patient-7").await.unwrap();

        assert_eq!(state, HandshakeState::PeerKnown);
        assert!(doctor.store.raw("medc/dr-lee/peer/patient-7").await.is_some());
    }

    #[tokio::test]
    async fn test_offline_directory_does_not_fail() {
        let dir = InMemoryDirectory::new();
        dir.set_offline(true);
        let patient = side("patient-7", &dir);

        let state = patient.exchange.start("dr-lee").await.unwrap();
        assert_eq!(state, HandshakeState::Uninitiated);
    }

    #[tokio::test]
    async fn test_slow_directory_times_out() {
        let dir = InMemoryDirectory::new();
        let doctor = side("dr-lee", &dir);
        doctor.exchange.start("patient-7").await.unwrap();

        dir.set_fetch_delay(Duration::from_secs(5));
        let patient = side("patient-7", &dir);

        let started = std::time::Instant::now();
        let state = patient.exchange.start("dr-lee").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(state, HandshakeState::LocalPublished);
    }

    #[tokio::test]
    async fn test_offer_ack_exchange() {
        let dir = InMemoryDirectory::new();
        dir.set_offline(true);
        let patient = side("patient-7", &dir);
        let doctor = side("dr-lee", &dir);

        let offer = patient.exchange.offer("dr-lee").await.unwrap();
        let ack = doctor
            .exchange
            .handle_message(offer)
            .await
            .unwrap()
            .expect("offer must be acknowledged");
        assert_eq!(ack.action, ExchangeAction::Ack);
        assert_eq!(ack.to, "patient-7");

        assert!(patient.exchange.handle_message(ack).await.unwrap().is_none());
        assert_eq!(patient.exchange.state("dr-lee").await, HandshakeState::PeerKnown);
        assert_eq!(doctor.exchange.state("patient-7").await, HandshakeState::PeerKnown);
    }

    #[tokio::test]
    async fn test_misaddressed_message_rejected() {
        let dir = InMemoryDirectory::new();
        let patient = side("patient-7", &dir);
        let doctor = side("dr-lee", &dir);

        let mut offer = patient.exchange.offer("dr-lee").await.unwrap();
        offer.to = "dr-someone-else".to_string();

        assert!(matches!(
            doctor.exchange.handle_message(offer).await,
            Err(CoreError::Protocol(ExchangeError::Misaddressed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_peer_keys_survive_cache_eviction() {
        let dir = InMemoryDirectory::new();
        let patient = side("patient-7", &dir);
        let doctor = side("dr-lee", &dir);

        let offer = patient.exchange.offer("dr-lee").await.unwrap();
        let expected = offer.public_keys.clone();
        doctor.exchange.handle_message(offer).await.unwrap();

        doctor.exchange.evict_cache().await;
        assert_eq!(doctor.exchange.state("patient-7").await, HandshakeState::Uninitiated);
        assert_eq!(
            doctor.exchange.peer_keys("patient-7").await.unwrap(),
            Some(expected)
        );
        assert_eq!(doctor.exchange.state("patient-7").await, HandshakeState::PeerKnown);
    }

    #[tokio::test]
    async fn test_unreadable_cached_peer_keys_are_ignored() {
        let dir = InMemoryDirectory::new();
        let patient = side("patient-7", &dir);
        patient
            .store
            .set("medc/patient-7/peer/dr-lee", b"{garbage".to_vec())
            .await
            .unwrap();

        assert_eq!(patient.exchange.peer_keys("dr-lee").await.unwrap(), None);
        assert_eq!(patient.exchange.state("dr-lee").await, HandshakeState::Uninitiated);

        // Fresh keys replace the bad entry.
        let doctor = side("dr-lee", &dir);
        let offer = doctor.exchange.offer("patient-7").await.unwrap();
        let expected = offer.public_keys.clone();
        patient.exchange.handle_message(offer).await.unwrap();
        patient.exchange.evict_cache().await;
        assert_eq!(patient.exchange.peer_keys("dr-lee").await.unwrap(), Some(expected));
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = KeyExchangeMessage {
            action: ExchangeAction::Offer,
            from: "patient-7".to_string(),
            to: "dr-lee".to_string(),
            public_keys: PeerKeys {
                agreement: medc_crypto::PublicKeyBundle::new(
                    medc_crypto::Algorithm::X25519,
                    vec![1u8; 32],
                ),
                encryption: None,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "key_exchange");
        assert!(json.get("publicKeys").is_some());
    }
}
