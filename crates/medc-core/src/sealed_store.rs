//! At-rest encryption for any `KeyStore`.
//!
//! Each value is stored as `version(1) || nonce || ciphertext+tag` under a
//! subkey derived from the storage key and the entry's path. Paths are left
//! in the clear so prefix listing still works.

use std::sync::Arc;

use async_trait::async_trait;
use medc_crypto::kdf::storage_subkey;
use medc_crypto::{CryptoProvider, SymmetricKey};

use crate::store::{KeyStore, StoreError};

const SEALED_VERSION: u8 = 1;

pub struct SealedKeyStore<S> {
    inner: S,
    storage_key: SymmetricKey,
    provider: Arc<dyn CryptoProvider>,
}

impl<S: KeyStore> SealedKeyStore<S> {
    pub fn new(inner: S, storage_key: SymmetricKey, provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            inner,
            storage_key,
            provider,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn seal(&self, path: &str, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let key = storage_subkey(&self.storage_key, path)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        let nonce = self
            .provider
            .random_bytes(self.provider.nonce_len())
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        let ct = self
            .provider
            .aead_encrypt(&key, &nonce, value)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(1 + nonce.len() + ct.len());
        out.push(SEALED_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn open(&self, path: &str, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce_len = self.provider.nonce_len();
        if sealed.len() < 1 + nonce_len + self.provider.tag_len() {
            return Err(StoreError::DataCorruption(format!("{}: sealed value too short", path)));
        }
        if sealed[0] != SEALED_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "{}: unknown sealed version {}",
                path, sealed[0]
            )));
        }
        let (nonce, ct) = sealed[1..].split_at(nonce_len);
        let key = storage_subkey(&self.storage_key, path)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        self.provider
            .aead_decrypt(&key, nonce, ct)
            .map_err(|_| StoreError::DataCorruption(format!("{}: authentication failed", path)))
    }
}

#[async_trait]
impl<S: KeyStore> KeyStore for SealedKeyStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.inner.get(key).await? {
            Some(sealed) => Ok(Some(self.open(key, &sealed)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let sealed = self.seal(key, &value)?;
        self.inner.set(key, sealed).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), StoreError> {
        let sealed = self.seal(key, &value)?;
        let (stored, inserted) = self.inner.insert_if_absent(key, sealed).await?;
        if inserted {
            return Ok((value, true));
        }
        Ok((self.open(key, &stored)?, false))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys_with_prefix(prefix).await
    }
}
