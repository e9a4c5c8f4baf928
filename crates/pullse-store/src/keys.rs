//! Conversation key material, stored hex-encoded per conversation.
//!
//! Keys are retrievable by conversation id only; there is deliberately no
//! enumeration API.

use pullse_shared::constants::{KEY_CONVERSATION_KEY_PREFIX, SYMMETRIC_KEY_SIZE};
use pullse_shared::crypto::SymmetricKey;
use pullse_shared::types::ConversationId;

use crate::database::Database;
use crate::error::{Result, StoreError};

fn key_key(conversation: &ConversationId) -> String {
    format!("{KEY_CONVERSATION_KEY_PREFIX}{conversation}")
}

impl Database {
    /// Load a conversation's symmetric key, if one has been set up.
    pub fn load_conversation_key(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<SymmetricKey>> {
        let Some(key_hex) = self.get_json::<String>(&key_key(conversation))? else {
            return Ok(None);
        };

        let bytes = hex::decode(&key_hex)?;
        if bytes.len() != SYMMETRIC_KEY_SIZE {
            return Err(StoreError::InvalidKeyMaterial(conversation.to_string()));
        }

        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    /// Persist a conversation's symmetric key.
    pub fn save_conversation_key(
        &self,
        conversation: &ConversationId,
        key: &SymmetricKey,
    ) -> Result<()> {
        self.put_json(&key_key(conversation), &hex::encode(key))
    }

    /// Delete a conversation's key together with the conversation itself.
    pub fn delete_conversation_key(&self, conversation: &ConversationId) -> Result<bool> {
        self.delete(&key_key(conversation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullse_shared::crypto::generate_conversation_key;

    #[test]
    fn test_key_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        assert!(db.load_conversation_key(&conv).unwrap().is_none());

        let key = generate_conversation_key();
        db.save_conversation_key(&conv, &key).unwrap();

        assert_eq!(db.load_conversation_key(&conv).unwrap(), Some(key));
    }

    #[test]
    fn test_invalid_material_rejected() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        db.put_json(&super::key_key(&conv), &"abcd".to_string())
            .unwrap();

        assert!(matches!(
            db.load_conversation_key(&conv),
            Err(StoreError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_delete_key() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        let key = generate_conversation_key();
        db.save_conversation_key(&conv, &key).unwrap();

        assert!(db.delete_conversation_key(&conv).unwrap());
        assert!(db.load_conversation_key(&conv).unwrap().is_none());
    }
}
