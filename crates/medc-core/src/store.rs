//! Key persistence.
//!
//! `KeyStore` is a small async key/value surface over opaque byte values.
//! Identity bundles, conversation keyrings and cached peer keys are all
//! stored under paths built by `KeySpace`, so one store can serve several
//! local users without collisions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable key/value storage for key material.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Retrieve a value. `Ok(None)` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or replace a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove a value. Succeeds if the key did not exist.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomic read-or-create.
    ///
    /// Returns the stored value and `true` if `value` was written, or the
    /// existing value and `false` if the key was already present.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), StoreError>;

    /// All keys starting with `prefix`, in lexical order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
impl<S: KeyStore + ?Sized> KeyStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), StoreError> {
        (**self).insert_if_absent(key, value).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).keys_with_prefix(prefix).await
    }
}

// ============================================================================
// Key paths
// ============================================================================

/// Store paths for one local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    user_id: String,
}

impl KeySpace {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity(&self) -> String {
        format!("medc/{}/identity", self.user_id)
    }

    pub fn conversation_prefix(&self) -> String {
        format!("medc/{}/conversation/", self.user_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> String {
        format!("{}{}", self.conversation_prefix(), conversation_id)
    }

    pub fn peer_prefix(&self) -> String {
        format!("medc/{}/peer/", self.user_id)
    }

    pub fn peer(&self, counterpart_id: &str) -> String {
        format!("{}{}", self.peer_prefix(), counterpart_id)
    }
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// In-memory store for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Raw stored bytes, bypassing any wrapper.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), StoreError> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            return Ok((existing.clone(), false));
        }
        entries.insert(key.to_string(), value.clone());
        Ok((value, true))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
