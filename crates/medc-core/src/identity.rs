//! Identity key manager.
//!
//! Owns the local user's `IdentityKeyBundle`: loads it from the key store on
//! first use, generates and persists one if none exists, and rotates the
//! agreement keypair on request. Creation and rotation run under one mutex so
//! a user never ends up with two competing bundles.

use std::sync::Arc;

use medc_crypto::bundle::Algorithm;
use medc_crypto::identity::{IdentityKeyBundle, StoredIdentity};
use medc_crypto::seal::{self, WrappedKey};
use medc_crypto::{CryptoProvider, Keypair, PeerKeys, PublicKeyBundle, SymmetricKey};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::CoreError;
use crate::store::{KeySpace, KeyStore, StoreError};

pub struct IdentityKeyManager {
    space: KeySpace,
    store: Arc<dyn KeyStore>,
    provider: Arc<dyn CryptoProvider>,
    active: Mutex<Option<Arc<IdentityKeyBundle>>>,
}

impl IdentityKeyManager {
    pub fn new(space: KeySpace, store: Arc<dyn KeyStore>, provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            space,
            store,
            provider,
            active: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        self.space.user_id()
    }

    /// The active bundle, loading or creating it on first use.
    pub async fn bundle(&self) -> Result<Arc<IdentityKeyBundle>, CoreError> {
        let mut active = self.active.lock().await;
        if let Some(bundle) = active.as_ref() {
            return Ok(bundle.clone());
        }
        let bundle = Arc::new(self.load_or_create().await?);
        *active = Some(bundle.clone());
        Ok(bundle)
    }

    pub async fn local_public_bundle(&self) -> Result<PublicKeyBundle, CoreError> {
        Ok(self.bundle().await?.public_bundle())
    }

    pub async fn local_public_keys(&self) -> Result<PeerKeys, CoreError> {
        Ok(self.bundle().await?.public_keys())
    }

    /// The agreement keypair used for conversation key derivation.
    pub async fn local_keypair(&self) -> Result<Keypair, CoreError> {
        Ok(self.bundle().await?.agreement().clone())
    }

    /// Replace the agreement keypair. Conversation keys are left as they are.
    pub async fn rotate(&self) -> Result<Arc<IdentityKeyBundle>, CoreError> {
        let mut active = self.active.lock().await;
        let current = match active.as_ref() {
            Some(bundle) => bundle.clone(),
            None => Arc::new(self.load_or_create().await?),
        };

        let rotated = current.rotated(self.provider.as_ref(), now_unix())?;
        self.persist(&rotated).await?;
        info!(
            user = %self.space.user_id(),
            generation = rotated.generation(),
            fingerprint = %rotated.public_bundle().fingerprint(),
            "Rotated identity agreement key"
        );

        let rotated = Arc::new(rotated);
        *active = Some(rotated.clone());
        Ok(rotated)
    }

    /// Seal a symmetric key to a counterpart's sealing key.
    pub async fn wrap_key_for(
        &self,
        counterpart: &PeerKeys,
        key: &SymmetricKey,
        context: &[u8],
    ) -> Result<WrappedKey, CoreError> {
        let sealing = counterpart
            .encryption
            .as_ref()
            .ok_or_else(|| CoreError::PeerKeyUnavailable("sealing key".to_string()))?;
        let recipient = self
            .provider
            .import_public_key(&sealing.key, Algorithm::X25519Seal)?;
        Ok(seal::wrap_key(&recipient, key, context)?)
    }

    /// Open a key sealed to the local sealing keypair.
    pub async fn unwrap_key(
        &self,
        wrapped: &WrappedKey,
        context: &[u8],
    ) -> Result<SymmetricKey, CoreError> {
        let bundle = self.bundle().await?;
        let sealing = bundle
            .encryption()
            .ok_or_else(|| CoreError::KeyGeneration("identity has no sealing keypair".to_string()))?;
        Ok(seal::unwrap_key(sealing, wrapped, context)?)
    }

    /// Forget the in-memory bundle; the next call reloads it from the store.
    pub async fn evict_cache(&self) {
        *self.active.lock().await = None;
    }

    async fn load_or_create(&self) -> Result<IdentityKeyBundle, CoreError> {
        let path = self.space.identity();
        if let Some(bytes) = self.store.get(&path).await? {
            debug!(user = %self.space.user_id(), "Loading existing identity keys");
            return decode(&bytes);
        }

        info!(user = %self.space.user_id(), "Generating new identity keys");
        let fresh = IdentityKeyBundle::generate(self.provider.as_ref(), now_unix())?;
        let encoded = encode(&fresh)?;

        // Another process may have created one in the meantime; theirs wins.
        let (stored, inserted) = self.store.insert_if_absent(&path, encoded).await?;
        if inserted {
            Ok(fresh)
        } else {
            decode(&stored)
        }
    }

    async fn persist(&self, bundle: &IdentityKeyBundle) -> Result<(), CoreError> {
        let encoded = encode(bundle)?;
        self.store.set(&self.space.identity(), encoded).await?;
        Ok(())
    }
}

/// The buffer holds private keys; callers move it into the store.
fn encode(bundle: &IdentityKeyBundle) -> Result<Vec<u8>, CoreError> {
    let stored = bundle.to_stored();
    Ok(serde_json::to_vec(&stored).map_err(StoreError::from)?)
}

fn decode(bytes: &[u8]) -> Result<IdentityKeyBundle, CoreError> {
    let stored: StoredIdentity = serde_json::from_slice(bytes).map_err(StoreError::from)?;
    Ok(IdentityKeyBundle::from_stored(&stored)?)
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyStore;
    use medc_crypto::DalekProvider;

    fn manager(store: Arc<dyn KeyStore>, user: &str) -> IdentityKeyManager {
        IdentityKeyManager::new(KeySpace::new(user), store, Arc::new(DalekProvider::new()))
    }

    #[tokio::test]
    async fn test_first_use_creates_and_persists() {
        let store = Arc::new(InMemoryKeyStore::new());
        let m = manager(store.clone(), "dr-lee");

        let keys = m.local_public_keys().await.unwrap();
        assert!(keys.encryption.is_some());
        assert!(store.raw("medc/dr-lee/identity").await.is_some());

        // Same bundle on the second call.
        assert_eq!(m.local_public_keys().await.unwrap(), keys);
    }

    #[tokio::test]
    async fn test_reload_after_restart() {
        let store = Arc::new(InMemoryKeyStore::new());
        let first = manager(store.clone(), "dr-lee").local_public_bundle().await.unwrap();

        let restarted = manager(store, "dr-lee");
        assert_eq!(restarted.local_public_bundle().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_yields_one_bundle() {
        let store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new());
        let m = Arc::new(manager(store, "patient-7"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(tokio::spawn(async move { m.local_public_bundle().await.unwrap() }));
        }
        let mut bundles = Vec::new();
        for h in handles {
            bundles.push(h.await.unwrap());
        }
        assert!(bundles.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_rotation_persists_new_generation() {
        let store = Arc::new(InMemoryKeyStore::new());
        let m = manager(store.clone(), "dr-lee");
        let before = m.local_public_bundle().await.unwrap();

        let rotated = m.rotate().await.unwrap();
        assert_eq!(rotated.generation(), 2);
        assert_ne!(rotated.public_bundle(), before);

        let reloaded = manager(store, "dr-lee");
        assert_eq!(reloaded.bundle().await.unwrap().generation(), 2);
        assert_eq!(reloaded.local_public_bundle().await.unwrap(), rotated.public_bundle());
    }

    #[tokio::test]
    async fn test_wrap_between_users() {
        let store: Arc<dyn KeyStore> = Arc::new(InMemoryKeyStore::new());
        let alice = manager(store.clone(), "alice");
        let bob = manager(store, "bob");
        let key = SymmetricKey::from_bytes([0x24u8; 32]);

        let bob_keys = bob.local_public_keys().await.unwrap();
        let wrapped = alice.wrap_key_for(&bob_keys, &key, b"conv-42").await.unwrap();

        assert_eq!(bob.unwrap_key(&wrapped, b"conv-42").await.unwrap(), key);
        assert!(alice.unwrap_key(&wrapped, b"conv-42").await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_identity_is_persistence_error() {
        let store = Arc::new(InMemoryKeyStore::new());
        store.set("medc/dr-lee/identity", b"{not json".to_vec()).await.unwrap();

        let m = manager(store, "dr-lee");
        assert!(matches!(
            m.bundle().await,
            Err(CoreError::Persistence(_))
        ));
    }
}
