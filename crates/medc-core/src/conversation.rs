//! Conversation keys.
//!
//! Each conversation has a keyring: every key version ever used, plus the
//! active one. A key is derived either by bootstrap (from the conversation id
//! alone) or by agreement (X25519 with the counterpart's published key). The
//! deriver writes a new version only when the method changes, which in
//! practice means once: bootstrap v1, then agreed v2 when the counterpart's
//! keys show up. Older versions stay so history keeps decrypting.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use medc_crypto::kdf::{agreed_key, bootstrap_key};
use medc_crypto::{Algorithm, CryptoProvider, PeerKeys, SymmetricKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CoreError;
use crate::exchange::KeyExchange;
use crate::identity::{now_unix, IdentityKeyManager};
use crate::store::{KeySpace, KeyStore, StoreError};

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationMethod {
    Bootstrap,
    Agreed,
}

impl DerivationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DerivationMethod::Bootstrap => "bootstrap",
            DerivationMethod::Agreed => "agreed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationKeyRecord {
    pub conversation_id: String,
    pub key: SymmetricKey,
    pub method: DerivationMethod,
    pub version: u32,
    pub created_at: i64,
}

/// All key versions of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationKeyring {
    conversation_id: String,
    active: u32,
    /// Ascending by version.
    records: Vec<ConversationKeyRecord>,
}

impl ConversationKeyring {
    pub fn new(first: ConversationKeyRecord) -> Self {
        Self {
            conversation_id: first.conversation_id.clone(),
            active: first.version,
            records: vec![first],
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn active(&self) -> &ConversationKeyRecord {
        self.records
            .iter()
            .find(|r| r.version == self.active)
            .unwrap_or_else(|| &self.records[self.records.len() - 1])
    }

    pub fn get(&self, version: u32) -> Option<&ConversationKeyRecord> {
        self.records.iter().find(|r| r.version == version)
    }

    pub fn latest_version(&self) -> u32 {
        self.records.iter().map(|r| r.version).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Active record first, then the rest newest-first.
    pub fn by_recency(&self) -> impl Iterator<Item = &ConversationKeyRecord> {
        let active = self.active();
        std::iter::once(active).chain(
            self.records
                .iter()
                .rev()
                .filter(move |r| r.version != active.version),
        )
    }

    /// Add a record and make it active.
    pub fn push(&mut self, record: ConversationKeyRecord) {
        self.active = record.version;
        self.records.push(record);
        self.records.sort_by_key(|r| r.version);
    }

    fn to_stored(&self) -> StoredKeyring {
        StoredKeyring {
            conversation_id: self.conversation_id.clone(),
            active: self.active,
            records: self
                .records
                .iter()
                .map(|r| StoredRecord {
                    key: STANDARD.encode(r.key.as_bytes()),
                    method: r.method,
                    version: r.version,
                    created_at: r.created_at,
                })
                .collect(),
        }
    }

    fn from_stored(stored: &StoredKeyring) -> Result<Self, StoreError> {
        if stored.records.is_empty() {
            return Err(StoreError::DataCorruption(format!(
                "keyring {} has no records",
                stored.conversation_id
            )));
        }
        let mut records = Vec::with_capacity(stored.records.len());
        for r in &stored.records {
            let bytes = STANDARD
                .decode(r.key.as_bytes())
                .map_err(|e| StoreError::DataCorruption(e.to_string()))?;
            let key = SymmetricKey::from_slice(&bytes)
                .map_err(|e| StoreError::DataCorruption(e.to_string()))?;
            records.push(ConversationKeyRecord {
                conversation_id: stored.conversation_id.clone(),
                key,
                method: r.method,
                version: r.version,
                created_at: r.created_at,
            });
        }
        records.sort_by_key(|r| r.version);
        Ok(Self {
            conversation_id: stored.conversation_id.clone(),
            active: stored.active,
            records,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(&self.to_stored())?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let stored: StoredKeyring = serde_json::from_slice(bytes)?;
        Self::from_stored(&stored)
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredKeyring {
    conversation_id: String,
    active: u32,
    records: Vec<StoredRecord>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    key: String,
    #[zeroize(skip)]
    method: DerivationMethod,
    version: u32,
    created_at: i64,
}

/// Summary row for status reporting. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationStatus {
    pub id: String,
    pub method: DerivationMethod,
    pub version: u32,
}

// ============================================================================
// Registry
// ============================================================================

/// In-memory keyring cache plus per-conversation single-flight locks.
#[derive(Default)]
pub struct KeyRegistry {
    keyrings: DashMap<String, Arc<ConversationKeyring>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationKeyring>> {
        self.keyrings.get(conversation_id).map(|e| e.value().clone())
    }

    pub fn insert(&self, keyring: Arc<ConversationKeyring>) {
        self.keyrings
            .insert(keyring.conversation_id().to_string(), keyring);
    }

    pub fn remove(&self, conversation_id: &str) {
        self.keyrings.remove(conversation_id);
    }

    pub fn clear(&self) {
        self.keyrings.clear();
    }

    pub fn len(&self) -> usize {
        self.keyrings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyrings.is_empty()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.keyrings.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of per-conversation locks currently allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop a conversation's lock unless someone holds or awaits it.
    fn release_lock(&self, conversation_id: &str) {
        self.locks
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn release_idle_locks(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

// ============================================================================
// Deriver
// ============================================================================

pub struct ConversationKeyDeriver {
    space: KeySpace,
    store: Arc<dyn KeyStore>,
    provider: Arc<dyn CryptoProvider>,
    identity: Arc<IdentityKeyManager>,
    exchange: Arc<KeyExchange>,
    registry: KeyRegistry,
    allow_bootstrap: bool,
}

impl ConversationKeyDeriver {
    pub fn new(
        space: KeySpace,
        store: Arc<dyn KeyStore>,
        provider: Arc<dyn CryptoProvider>,
        identity: Arc<IdentityKeyManager>,
        exchange: Arc<KeyExchange>,
        allow_bootstrap: bool,
    ) -> Self {
        Self {
            space,
            store,
            provider,
            identity,
            exchange,
            registry: KeyRegistry::new(),
            allow_bootstrap,
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// The conversation's keyring, deriving the first key or upgrading a
    /// bootstrap key to an agreed one as needed.
    ///
    /// Concurrent callers for one conversation are serialized; the first one
    /// derives and persists, the others see its result.
    pub async fn resolve(
        &self,
        conversation_id: &str,
        counterpart: Option<&str>,
    ) -> Result<Arc<ConversationKeyring>, CoreError> {
        if let Some(keyring) = self.registry.get(conversation_id) {
            if keyring.active().method == DerivationMethod::Agreed || counterpart.is_none() {
                return Ok(keyring);
            }
        }

        let lock = self.registry.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let peer = match counterpart {
            Some(c) => self.exchange.peer_keys(c).await?,
            None => None,
        };

        let keyring = match self.load(conversation_id).await? {
            Some(keyring) => keyring,
            None => self.create(conversation_id, peer.as_ref()).await?,
        };
        let keyring = match (&peer, keyring.active().method) {
            (Some(peer), DerivationMethod::Bootstrap) => self.upgrade(keyring, peer).await?,
            _ => keyring,
        };

        if let Some(c) = counterpart {
            if keyring.active().method == DerivationMethod::Agreed && peer.is_some() {
                self.exchange.mark_established(c).await;
            }
        }

        let keyring = Arc::new(keyring);
        self.registry.insert(keyring.clone());
        Ok(keyring)
    }

    /// Keyring if one exists, without deriving anything.
    pub async fn existing(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Arc<ConversationKeyring>>, CoreError> {
        if let Some(keyring) = self.registry.get(conversation_id) {
            return Ok(Some(keyring));
        }
        Ok(self.load(conversation_id).await?.map(Arc::new))
    }

    /// Drop one conversation's keys from memory and the store.
    pub async fn clear(&self, conversation_id: &str) -> Result<(), CoreError> {
        self.clear_locked(conversation_id).await?;
        info!(conversation = %conversation_id, "Cleared conversation keys");
        Ok(())
    }

    /// Drop every conversation keyring of the local user. Returns how many
    /// persisted keyrings were removed.
    ///
    /// Each conversation is cleared under its own lock, so a concurrent
    /// `resolve` either finishes before the delete or derives afresh after it.
    pub async fn clear_all(&self) -> Result<usize, CoreError> {
        let prefix = self.space.conversation_prefix();
        let persisted: Vec<String> = self
            .store
            .keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|p| p.strip_prefix(&prefix).map(str::to_string))
            .collect();

        let mut ids = persisted.clone();
        ids.extend(self.registry.conversation_ids());
        ids.sort();
        ids.dedup();
        for id in &ids {
            self.clear_locked(id).await?;
        }
        self.registry.release_idle_locks();

        info!(user = %self.space.user_id(), count = persisted.len(), "Cleared all conversation keys");
        Ok(persisted.len())
    }

    /// Forget cached keyrings; the store is untouched.
    pub fn evict_cache(&self) {
        self.registry.clear();
        self.registry.release_idle_locks();
    }

    async fn clear_locked(&self, conversation_id: &str) -> Result<(), CoreError> {
        {
            let lock = self.registry.lock_for(conversation_id);
            let _guard = lock.lock().await;
            self.registry.remove(conversation_id);
            self.store
                .delete(&self.space.conversation(conversation_id))
                .await?;
        }
        self.registry.release_lock(conversation_id);
        Ok(())
    }

    /// Method and active version of every known conversation, sorted by id.
    pub async fn status(&self) -> Vec<ConversationStatus> {
        let prefix = self.space.conversation_prefix();
        let mut ids: Vec<String> = match self.store.keys_with_prefix(&prefix).await {
            Ok(paths) => paths
                .into_iter()
                .filter_map(|p| p.strip_prefix(&prefix).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list persisted conversations");
                Vec::new()
            }
        };
        ids.extend(self.registry.conversation_ids());
        ids.sort();
        ids.dedup();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.existing(&id).await {
                Ok(Some(keyring)) => {
                    let active = keyring.active();
                    out.push(ConversationStatus {
                        id,
                        method: active.method,
                        version: active.version,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(conversation = %id, error = %e, "Skipping unreadable keyring"),
            }
        }
        out
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationKeyring>, CoreError> {
        if let Some(keyring) = self.registry.get(conversation_id) {
            return Ok(Some((*keyring).clone()));
        }
        match self.store.get(&self.space.conversation(conversation_id)).await {
            Ok(Some(bytes)) => Ok(Some(ConversationKeyring::decode(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to read keyring");
                Ok(None)
            }
        }
    }

    async fn create(
        &self,
        conversation_id: &str,
        peer: Option<&PeerKeys>,
    ) -> Result<ConversationKeyring, CoreError> {
        let agreed = match peer {
            Some(peer) => match self.agreed_record(conversation_id, peer, 1).await {
                Ok(record) => Some(record),
                Err(e) if !e.is_fatal() => {
                    warn!(conversation = %conversation_id, error = %e, "Agreed key unavailable");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let record = match agreed {
            Some(record) => record,
            None if self.allow_bootstrap => self.bootstrap_record(conversation_id, 1),
            None => {
                return Err(CoreError::PeerKeyUnavailable(format!(
                    "no counterpart keys for conversation {}",
                    conversation_id
                )))
            }
        };
        let keyring = ConversationKeyring::new(record);

        let path = self.space.conversation(conversation_id);
        match self.store.insert_if_absent(&path, keyring.encode()?).await {
            Ok((_, true)) => {
                info!(
                    conversation = %conversation_id,
                    method = keyring.active().method.as_str(),
                    version = 1,
                    "Created conversation key"
                );
                Ok(keyring)
            }
            Ok((existing, false)) => {
                debug!(conversation = %conversation_id, "Keyring created concurrently, using stored one");
                Ok(ConversationKeyring::decode(&existing)?)
            }
            Err(e) => {
                warn!(
                    conversation = %conversation_id,
                    error = %e,
                    "Failed to persist conversation key, keeping it in memory only"
                );
                Ok(keyring)
            }
        }
    }

    async fn upgrade(
        &self,
        mut keyring: ConversationKeyring,
        peer: &PeerKeys,
    ) -> Result<ConversationKeyring, CoreError> {
        let conversation_id = keyring.conversation_id().to_string();
        let version = keyring.latest_version() + 1;
        let record = match self.agreed_record(&conversation_id, peer, version).await {
            Ok(record) => record,
            Err(e) if !e.is_fatal() => {
                warn!(conversation = %conversation_id, error = %e, "Agreed key unavailable, staying on bootstrap");
                return Ok(keyring);
            }
            Err(e) => return Err(e),
        };
        keyring.push(record);

        if let Err(e) = self
            .store
            .set(&self.space.conversation(&conversation_id), keyring.encode()?)
            .await
        {
            warn!(
                conversation = %conversation_id,
                error = %e,
                "Failed to persist upgraded key, keeping it in memory only"
            );
        }
        info!(
            conversation = %conversation_id,
            version = version,
            "Upgraded conversation key from bootstrap to agreed"
        );
        Ok(keyring)
    }

    fn bootstrap_record(&self, conversation_id: &str, version: u32) -> ConversationKeyRecord {
        ConversationKeyRecord {
            conversation_id: conversation_id.to_string(),
            key: bootstrap_key(conversation_id),
            method: DerivationMethod::Bootstrap,
            version,
            created_at: now_unix(),
        }
    }

    async fn agreed_record(
        &self,
        conversation_id: &str,
        peer: &PeerKeys,
        version: u32,
    ) -> Result<ConversationKeyRecord, CoreError> {
        let local = self.identity.local_keypair().await?;
        // A bad counterpart key is treated like a missing one.
        let shared = self
            .provider
            .import_public_key(&peer.agreement.key, Algorithm::X25519)
            .and_then(|peer_pub| self.provider.derive_shared_key(&local, &peer_pub))
            .map_err(|e| {
                CoreError::PeerKeyUnavailable(format!("unusable agreement key: {}", e))
            })?;
        Ok(ConversationKeyRecord {
            conversation_id: conversation_id.to_string(),
            key: agreed_key(&shared, conversation_id)?,
            method: DerivationMethod::Agreed,
            version,
            created_at: now_unix(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: u32, method: DerivationMethod, byte: u8) -> ConversationKeyRecord {
        ConversationKeyRecord {
            conversation_id: "conv-42".to_string(),
            key: SymmetricKey::from_bytes([byte; 32]),
            method,
            version,
            created_at: 0,
        }
    }

    #[test]
    fn test_keyring_by_recency() {
        let mut keyring = ConversationKeyring::new(record(1, DerivationMethod::Bootstrap, 1));
        keyring.push(record(2, DerivationMethod::Agreed, 2));
        keyring.push(record(3, DerivationMethod::Agreed, 3));

        let versions: Vec<u32> = keyring.by_recency().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(keyring.active().method, DerivationMethod::Agreed);
        assert_eq!(keyring.latest_version(), 3);
    }

    #[test]
    fn test_keyring_stored_round_trip() {
        let mut keyring = ConversationKeyring::new(record(1, DerivationMethod::Bootstrap, 1));
        keyring.push(record(2, DerivationMethod::Agreed, 2));

        let restored = ConversationKeyring::decode(&keyring.encode().unwrap()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.active().version, 2);
        assert_eq!(restored.get(1).unwrap().key, SymmetricKey::from_bytes([1; 32]));
    }

    #[test]
    fn test_stored_format_uses_method_names() {
        let keyring = ConversationKeyring::new(record(1, DerivationMethod::Bootstrap, 1));
        let json: serde_json::Value = serde_json::from_slice(&keyring.encode().unwrap()).unwrap();
        assert_eq!(json["conversationId"], "conv-42");
        assert_eq!(json["records"][0]["method"], "bootstrap");
    }

    #[test]
    fn test_empty_stored_keyring_rejected() {
        let json = br#"{"conversationId":"c","active":1,"records":[]}"#;
        assert!(matches!(
            ConversationKeyring::decode(json),
            Err(StoreError::DataCorruption(_))
        ));
    }

    #[test]
    fn test_registry_lock_is_shared_per_conversation() {
        let registry = KeyRegistry::new();
        let a = registry.lock_for("c1");
        let b = registry.lock_for("c1");
        let c = registry.lock_for("c2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_registry_releases_only_idle_locks() {
        let registry = KeyRegistry::new();
        let held = registry.lock_for("c1");
        drop(registry.lock_for("c2"));
        assert_eq!(registry.lock_count(), 2);

        registry.release_lock("c1");
        registry.release_lock("c2");
        assert_eq!(registry.lock_count(), 1);

        drop(held);
        registry.release_idle_locks();
        assert_eq!(registry.lock_count(), 0);
    }
}
