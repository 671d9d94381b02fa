//! Test harness for two-party encryption flows.
//!
//! Builds a patient and a doctor that share one in-memory key directory, plus
//! store and provider wrappers that inject failures or count calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use medc_crypto::bundle::Algorithm;
use medc_crypto::{CryptoError, CryptoProvider, DalekProvider, Keypair, PeerPublicKey, SymmetricKey};

use crate::config::EncryptionConfig;
use crate::directory::InMemoryDirectory;
use crate::errors::CoreError;
use crate::service::MessageEncryption;
use crate::store::{InMemoryKeyStore, KeyStore, StoreError};

pub const PATIENT: &str = "patient-7";
pub const DOCTOR: &str = "dr-lee";
pub const CONVERSATION: &str = "conv-42";

/// Store that fails every write whose path contains `segment`.
#[derive(Clone)]
pub struct WriteFailingStore {
    inner: InMemoryKeyStore,
    segment: String,
}

impl WriteFailingStore {
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            inner: InMemoryKeyStore::new(),
            segment: segment.into(),
        }
    }

    pub fn inner(&self) -> &InMemoryKeyStore {
        &self.inner
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if key.contains(&self.segment) {
            return Err(StoreError::OperationFailed(format!("write refused: {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for WriteFailingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), StoreError> {
        self.check(key)?;
        self.inner.insert_if_absent(key, value).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys_with_prefix(prefix).await
    }
}

/// `DalekProvider` that counts AEAD calls.
#[derive(Default)]
pub struct CountingProvider {
    inner: DalekProvider,
    aead_calls: AtomicUsize,
}

impl CountingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aead_calls(&self) -> usize {
        self.aead_calls.load(Ordering::SeqCst)
    }
}

impl CryptoProvider for CountingProvider {
    fn generate_agreement_keypair(&self) -> Result<Keypair, CryptoError> {
        self.inner.generate_agreement_keypair()
    }

    fn generate_encryption_keypair(&self) -> Result<Keypair, CryptoError> {
        self.inner.generate_encryption_keypair()
    }

    fn import_public_key(
        &self,
        bytes: &[u8],
        algorithm: Algorithm,
    ) -> Result<PeerPublicKey, CryptoError> {
        self.inner.import_public_key(bytes, algorithm)
    }

    fn derive_shared_key(
        &self,
        private: &Keypair,
        peer: &PeerPublicKey,
    ) -> Result<SymmetricKey, CryptoError> {
        self.inner.derive_shared_key(private, peer)
    }

    fn aead_encrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.aead_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.aead_encrypt(key, nonce, plaintext)
    }

    fn aead_decrypt(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.aead_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.aead_decrypt(key, nonce, ciphertext)
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        self.inner.random_bytes(len)
    }
}

/// Build one participant on `store` and `directory`.
pub fn participant(
    config: EncryptionConfig,
    store: Arc<dyn KeyStore>,
    directory: &InMemoryDirectory,
) -> Result<MessageEncryption, CoreError> {
    MessageEncryption::new(
        config,
        store,
        Arc::new(directory.clone()),
        Arc::new(DalekProvider::new()),
    )
}

/// A patient and a doctor sharing one directory, each with its own store.
pub struct TwoParty {
    pub directory: InMemoryDirectory,
    pub patient_store: InMemoryKeyStore,
    pub doctor_store: InMemoryKeyStore,
    pub patient: MessageEncryption,
    pub doctor: MessageEncryption,
}

impl TwoParty {
    pub fn new() -> Result<Self, CoreError> {
        Self::with_config(|_| {})
    }

    /// Apply `tweak` to both participants' configuration.
    pub fn with_config(tweak: impl Fn(&mut EncryptionConfig)) -> Result<Self, CoreError> {
        let directory = InMemoryDirectory::new();
        let patient_store = InMemoryKeyStore::new();
        let doctor_store = InMemoryKeyStore::new();

        let mut patient_config = EncryptionConfig::for_user(PATIENT);
        tweak(&mut patient_config);
        let mut doctor_config = EncryptionConfig::for_user(DOCTOR);
        tweak(&mut doctor_config);

        let patient = participant(patient_config, Arc::new(patient_store.clone()), &directory)?;
        let doctor = participant(doctor_config, Arc::new(doctor_store.clone()), &directory)?;

        Ok(Self {
            directory,
            patient_store,
            doctor_store,
            patient,
            doctor,
        })
    }

    /// Both sides open `CONVERSATION`, the patient publishing first.
    pub async fn open(&self) -> Result<(), CoreError> {
        self.patient.open_conversation(CONVERSATION, DOCTOR).await?;
        self.doctor.open_conversation(CONVERSATION, PATIENT).await?;
        Ok(())
    }
}

/// Run a complete exchange: both sides open the conversation, the patient
/// writes, the doctor reads and replies. Returns the doctor's view of the
/// patient's message and the patient's view of the reply.
pub async fn run_conversation_flow(
    parties: &TwoParty,
    message: &str,
    reply: &str,
) -> Result<(String, String), CoreError> {
    parties.open().await?;

    let sent = parties.patient.encrypt(CONVERSATION, message).await?;
    let received = parties.doctor.decrypt(CONVERSATION, &sent, PATIENT).await?;

    let answer = parties.doctor.encrypt(CONVERSATION, reply).await?;
    let answered = parties.patient.decrypt(CONVERSATION, &answer, DOCTOR).await?;

    Ok((received, answered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conversation_flow() {
        let parties = TwoParty::new().unwrap();
        let (received, answered) = run_conversation_flow(&parties, "Hello, Doctor", "Hello, patient")
            .await
            .expect("conversation flow should succeed");

        assert_eq!(received, "Hello, Doctor");
        assert_eq!(answered, "Hello, patient");
    }

    #[tokio::test]
    async fn test_write_failing_store_refuses_segment() {
        let store = WriteFailingStore::new("/conversation/");
        assert!(store.set("medc/a/conversation/c1", vec![1]).await.is_err());
        store.set("medc/a/identity", vec![1]).await.unwrap();
        assert_eq!(store.inner().len().await, 1);
    }
}
