//! Per-conversation end-to-end encryption.
//!
//! Key lifecycle lives here: keys are created lazily on first encrypted
//! send, persisted hex-encoded in the local store, and retrievable by
//! conversation id only.  Setup is idempotent; calling it twice never
//! rotates an existing key.
//!
//! Decrypt failure is non-fatal by contract: a corrupt envelope or missing
//! key yields a fixed placeholder so one bad message cannot block rendering
//! the rest of a conversation.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use pullse_shared::constants::DECRYPT_FAILED_PLACEHOLDER;
use pullse_shared::crypto::{generate_conversation_key, CipherEnvelope, SymmetricKey};
use pullse_shared::model::ChatMessage;
use pullse_shared::types::ConversationId;
use pullse_store::Database;

use crate::error::{ClientError, Result};

#[derive(Clone)]
pub struct EncryptionService {
    store: Arc<Mutex<Database>>,
}

impl EncryptionService {
    pub fn new(store: Arc<Mutex<Database>>) -> Self {
        Self { store }
    }

    /// Ensure a conversation has a key, creating one on first call.
    ///
    /// Idempotent: an existing key is returned unchanged, never rotated.
    pub fn setup_conversation_encryption(
        &self,
        conversation: &ConversationId,
    ) -> Result<SymmetricKey> {
        let store = self.store.lock().unwrap();

        if let Some(existing) = store.load_conversation_key(conversation)? {
            return Ok(existing);
        }

        let key = generate_conversation_key();
        store.save_conversation_key(conversation, &key)?;
        debug!(conversation = %conversation, "conversation key created");
        Ok(key)
    }

    /// A conversation's key, if encryption has been set up for it.
    pub fn get_conversation_key(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<SymmetricKey>> {
        let store = self.store.lock().unwrap();
        Ok(store.load_conversation_key(conversation)?)
    }

    /// Encrypt a message's content into its envelope form.
    ///
    /// The returned copy keeps the plaintext in `content` for immediate
    /// display; [`ChatMessage::storage_form`] strips it before persistence
    /// or transmission.
    pub fn encrypt_message(
        &self,
        message: &ChatMessage,
        key: &SymmetricKey,
    ) -> Result<ChatMessage> {
        let envelope = CipherEnvelope::seal(key, message.content.as_bytes())?;

        let mut encrypted = message.clone();
        encrypted.encrypted = true;
        encrypted.encrypted_content = Some(envelope);
        Ok(encrypted)
    }

    /// Decrypt a message for display.  Never fails: a missing key, corrupt
    /// envelope, or non-UTF-8 plaintext yields the placeholder content.
    pub fn decrypt_message(
        &self,
        mut message: ChatMessage,
        key: Option<&SymmetricKey>,
    ) -> ChatMessage {
        if !message.encrypted {
            return message;
        }

        let decrypted = key
            .zip(message.encrypted_content.as_ref())
            .and_then(|(key, envelope)| envelope.open(key).ok())
            .and_then(|plaintext| String::from_utf8(plaintext).ok());

        match decrypted {
            Some(content) => message.content = content,
            None => {
                warn!(message = %message.id, "failed to decrypt message, substituting placeholder");
                message.content = DECRYPT_FAILED_PLACEHOLDER.to_string();
            }
        }
        message
    }

    /// Decrypt a batch, loading the conversation key once.
    pub fn decrypt_for_read(
        &self,
        conversation: &ConversationId,
        messages: Vec<ChatMessage>,
    ) -> Result<Vec<ChatMessage>> {
        let needs_key = messages.iter().any(|m| m.encrypted);
        let key = if needs_key {
            self.get_conversation_key(conversation)?
        } else {
            None
        };

        Ok(messages
            .into_iter()
            .map(|m| self.decrypt_message(m, key.as_ref()))
            .collect())
    }

    /// A conversation's key, failing if none exists.
    pub fn require_conversation_key(
        &self,
        conversation: &ConversationId,
    ) -> Result<SymmetricKey> {
        self.get_conversation_key(conversation)?
            .ok_or_else(|| ClientError::MissingKey(conversation.to_string()))
    }
}
