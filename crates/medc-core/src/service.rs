//! `MessageEncryption`: the facade the chat layer talks to.
//!
//! Wires the identity manager, key exchange, conversation key deriver and
//! message cipher for one local user. Payloads in and out are opaque strings
//! in the wire format `base64(nonce || ciphertext+tag)`, with `""` for an
//! empty message.

use std::sync::Arc;

use dashmap::DashMap;
use medc_crypto::legacy::{classify, PayloadKind};
use medc_crypto::seal::WrappedKey;
use medc_crypto::{CryptoProvider, PeerKeys, PublicKeyBundle, SymmetricKey};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cipher::{DecryptOutcome, Decrypted, MessageCipher};
use crate::config::EncryptionConfig;
use crate::conversation::{ConversationKeyDeriver, ConversationStatus, DerivationMethod};
use crate::directory::KeyDirectory;
use crate::errors::CoreError;
use crate::exchange::{HandshakeState, KeyExchange, KeyExchangeMessage};
use crate::identity::IdentityKeyManager;
use crate::store::{KeySpace, KeyStore};

/// Snapshot reported by `encryption_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionStatus {
    pub supported: bool,
    pub user_id: String,
    pub identity_generation: Option<u32>,
    pub active_conversations: usize,
    pub conversations: Vec<ConversationStatus>,
}

pub struct MessageEncryption {
    config: EncryptionConfig,
    identity: Arc<IdentityKeyManager>,
    exchange: Arc<KeyExchange>,
    deriver: ConversationKeyDeriver,
    cipher: MessageCipher,
    /// conversation id -> counterpart user id
    bindings: DashMap<String, String>,
}

impl MessageEncryption {
    pub fn new(
        config: EncryptionConfig,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn KeyDirectory>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let space = KeySpace::new(config.user_id.clone());
        let identity = Arc::new(IdentityKeyManager::new(
            space.clone(),
            store.clone(),
            provider.clone(),
        ));
        let exchange = Arc::new(KeyExchange::new(
            space.clone(),
            identity.clone(),
            directory,
            store.clone(),
            config.directory_timeout(),
        ));
        let deriver = ConversationKeyDeriver::new(
            space,
            store,
            provider.clone(),
            identity.clone(),
            exchange.clone(),
            config.allow_bootstrap,
        );

        Ok(Self {
            config,
            identity,
            exchange,
            deriver,
            cipher: MessageCipher::new(provider),
            bindings: DashMap::new(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Key exchange
    // ------------------------------------------------------------------------

    /// Publish local keys and try to fetch the counterpart's. Never blocks
    /// longer than the directory timeout and never fails on directory errors.
    pub async fn start_conversation_encryption(
        &self,
        counterpart: &str,
    ) -> Result<HandshakeState, CoreError> {
        let state = self.exchange.start(counterpart).await?;
        info!(counterpart = %counterpart, state = ?state, "Conversation encryption started");
        Ok(state)
    }

    /// Associate a conversation with its counterpart so `encrypt` can use an
    /// agreed key.
    pub fn bind_conversation(&self, conversation_id: &str, counterpart: &str) {
        self.bindings
            .insert(conversation_id.to_string(), counterpart.to_string());
    }

    /// Bind, start the exchange and resolve the conversation key.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        counterpart: &str,
    ) -> Result<ConversationStatus, CoreError> {
        self.bind_conversation(conversation_id, counterpart);
        self.start_conversation_encryption(counterpart).await?;
        let keyring = self
            .deriver
            .resolve(conversation_id, Some(counterpart))
            .await?;
        let active = keyring.active();
        Ok(ConversationStatus {
            id: conversation_id.to_string(),
            method: active.method,
            version: active.version,
        })
    }

    pub async fn handshake_state(&self, counterpart: &str) -> HandshakeState {
        self.exchange.state(counterpart).await
    }

    pub async fn key_exchange_offer(&self, counterpart: &str) -> Result<KeyExchangeMessage, CoreError> {
        self.exchange.offer(counterpart).await
    }

    /// Consume an inbound key exchange message; offers yield an ack to send back.
    pub async fn handle_key_exchange(
        &self,
        msg: KeyExchangeMessage,
    ) -> Result<Option<KeyExchangeMessage>, CoreError> {
        self.exchange.handle_message(msg).await
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Encrypt a message for a conversation.
    pub async fn encrypt(&self, conversation_id: &str, plaintext: &str) -> Result<String, CoreError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let counterpart = self.counterpart_of(conversation_id);
        let keyring = self
            .deriver
            .resolve(conversation_id, counterpart.as_deref())
            .await?;
        let record = keyring.active();
        let envelope = self.cipher.seal(record, plaintext)?;
        debug!(
            conversation = %conversation_id,
            version = record.version,
            method = record.method.as_str(),
            "Encrypted message"
        );
        Ok(envelope.to_payload())
    }

    /// Decrypt an inbound payload. Historical plaintext and undecryptable
    /// ciphertext come back unchanged.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        payload: &str,
        counterpart: &str,
    ) -> Result<String, CoreError> {
        Ok(self
            .decrypt_detailed(conversation_id, payload, counterpart)
            .await?
            .text)
    }

    /// Like `decrypt`, also reporting how the payload was handled.
    pub async fn decrypt_detailed(
        &self,
        conversation_id: &str,
        payload: &str,
        counterpart: &str,
    ) -> Result<Decrypted, CoreError> {
        // Our own messages come back with ourselves as sender; they use the
        // key of whoever the conversation is already bound to.
        let bound = if counterpart == self.user_id() {
            self.counterpart_of(conversation_id)
        } else {
            self.bind_conversation(conversation_id, counterpart);
            Some(counterpart.to_string())
        };
        let counterpart = bound.as_deref();

        let first = self.try_decrypt(conversation_id, payload, counterpart).await?;
        if first.outcome != DecryptOutcome::Undecryptable {
            return Ok(first);
        }
        let Some(peer) = counterpart else {
            return Ok(first);
        };

        // The sender may already use an agreed key we cannot derive yet.
        // If we have never seen the counterpart's keys, look once more.
        match self.refresh_peer_keys(peer).await {
            Ok(true) => self.try_decrypt(conversation_id, payload, counterpart).await,
            Ok(false) => Ok(first),
            Err(e) => {
                warn!(conversation = %conversation_id, peer = %peer, error = %e, "Peer key refresh failed");
                Ok(first)
            }
        }
    }

    /// Returns whether peer keys newly became available.
    async fn refresh_peer_keys(&self, peer: &str) -> Result<bool, CoreError> {
        if self.exchange.peer_keys(peer).await?.is_some() {
            return Ok(false);
        }
        self.exchange.start(peer).await?;
        Ok(self.exchange.peer_keys(peer).await?.is_some())
    }

    async fn try_decrypt(
        &self,
        conversation_id: &str,
        payload: &str,
        counterpart: Option<&str>,
    ) -> Result<Decrypted, CoreError> {
        // Sentinel and legacy text need no key.
        if !matches!(classify(payload), PayloadKind::Ciphertext(_)) {
            return Ok(self
                .cipher
                .decrypt_payload(conversation_id, None, payload, false));
        }
        let keyring = match self.deriver.resolve(conversation_id, counterpart).await {
            Ok(keyring) => Some(keyring),
            Err(e) if !e.is_fatal() => {
                warn!(conversation = %conversation_id, error = %e, "No conversation key for decryption");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(self.cipher.decrypt_payload(
            conversation_id,
            keyring.as_deref(),
            payload,
            self.config.allow_bootstrap,
        ))
    }

    // ------------------------------------------------------------------------
    // Key management
    // ------------------------------------------------------------------------

    pub async fn public_keys(&self) -> Result<PeerKeys, CoreError> {
        self.identity.local_public_keys().await
    }

    /// Push the local keys to the directory, bounded by the directory timeout.
    pub async fn publish_public_keys(&self) -> Result<(), CoreError> {
        self.exchange.publish_local().await
    }

    /// New agreement keypair, republished to the directory. Existing
    /// conversation keys are not re-derived.
    pub async fn rotate_identity_key(&self) -> Result<PublicKeyBundle, CoreError> {
        let rotated = self.identity.rotate().await?;
        if let Err(e) = self.exchange.publish_local().await {
            warn!(error = %e, "Failed to republish rotated keys");
        }
        Ok(rotated.public_bundle())
    }

    pub async fn clear_conversation_key(&self, conversation_id: &str) -> Result<(), CoreError> {
        self.deriver.clear(conversation_id).await
    }

    pub async fn clear_all_conversation_keys(&self) -> Result<usize, CoreError> {
        self.deriver.clear_all().await
    }

    pub async fn is_agreed_key_available(&self, conversation_id: &str) -> bool {
        match self.deriver.existing(conversation_id).await {
            Ok(Some(keyring)) => keyring.active().method == DerivationMethod::Agreed,
            Ok(None) => false,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to read keyring");
                false
            }
        }
    }

    pub async fn encryption_status(&self) -> EncryptionStatus {
        let identity_generation = match self.identity.bundle().await {
            Ok(bundle) => Some(bundle.generation()),
            Err(e) => {
                warn!(error = %e, "Identity unavailable for status");
                None
            }
        };
        let conversations = self.deriver.status().await;
        EncryptionStatus {
            supported: identity_generation.is_some(),
            user_id: self.config.user_id.clone(),
            identity_generation,
            active_conversations: conversations.len(),
            conversations,
        }
    }

    /// Seal the active conversation key to the counterpart's sealing key for
    /// out-of-band transfer. The conversation id is bound as context.
    pub async fn wrap_conversation_key(
        &self,
        conversation_id: &str,
        counterpart: &str,
    ) -> Result<WrappedKey, CoreError> {
        let peer = self
            .exchange
            .peer_keys(counterpart)
            .await?
            .ok_or_else(|| CoreError::PeerKeyUnavailable(counterpart.to_string()))?;
        let keyring = self
            .deriver
            .resolve(conversation_id, Some(counterpart))
            .await?;
        self.identity
            .wrap_key_for(&peer, &keyring.active().key, conversation_id.as_bytes())
            .await
    }

    /// Open a key sealed to the local user for `conversation_id`.
    pub async fn unwrap_conversation_key(
        &self,
        conversation_id: &str,
        wrapped: &WrappedKey,
    ) -> Result<SymmetricKey, CoreError> {
        self.identity
            .unwrap_key(wrapped, conversation_id.as_bytes())
            .await
    }

    /// Drop every in-memory cache; the next call reloads from the store.
    pub async fn evict_caches(&self) {
        self.deriver.evict_cache();
        self.exchange.evict_cache().await;
        self.identity.evict_cache().await;
    }

    fn counterpart_of(&self, conversation_id: &str) -> Option<String> {
        self.bindings
            .get(conversation_id)
            .map(|e| e.value().clone())
    }
}
