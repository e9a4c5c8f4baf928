//! Typed accessors for conversation lists and per-conversation message
//! records.

use chrono::Utc;

use pullse_shared::constants::{
    KEY_CONVERSATIONS_PREFIX, KEY_CONVERSATION_PREFIX, KEY_CURRENT_CONVERSATION_PREFIX,
};
use pullse_shared::model::{ChatMessage, Conversation, ConversationRecord};
use pullse_shared::types::{ConversationId, WorkspaceId};

use crate::database::Database;
use crate::error::Result;

fn conversations_key(workspace: &WorkspaceId) -> String {
    format!("{KEY_CONVERSATIONS_PREFIX}{workspace}")
}

fn current_conversation_key(workspace: &WorkspaceId) -> String {
    format!("{KEY_CURRENT_CONVERSATION_PREFIX}{workspace}")
}

fn conversation_key(conversation: &ConversationId) -> String {
    format!("{KEY_CONVERSATION_PREFIX}{conversation}")
}

impl Database {
    /// Load the workspace's conversation list (empty if never saved).
    pub fn load_conversations(&self, workspace: &WorkspaceId) -> Result<Vec<Conversation>> {
        Ok(self
            .get_json(&conversations_key(workspace))?
            .unwrap_or_default())
    }

    /// Replace the workspace's conversation list.
    pub fn save_conversations(
        &self,
        workspace: &WorkspaceId,
        conversations: &[Conversation],
    ) -> Result<()> {
        self.put_json(&conversations_key(workspace), &conversations)
    }

    /// The conversation currently open in the widget, if any.
    pub fn load_current_conversation(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Option<ConversationId>> {
        self.get_json(&current_conversation_key(workspace))
    }

    pub fn save_current_conversation(
        &self,
        workspace: &WorkspaceId,
        conversation: &ConversationId,
    ) -> Result<()> {
        self.put_json(&current_conversation_key(workspace), conversation)
    }

    /// Load a conversation's message record, if one exists.
    pub fn load_conversation_record(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<ConversationRecord>> {
        self.get_json(&conversation_key(conversation))
    }

    /// Replace a conversation's message record and stamp `last_updated`.
    pub fn save_conversation_record(
        &self,
        conversation: &ConversationId,
        record: &ConversationRecord,
    ) -> Result<()> {
        let mut record = record.clone();
        record.last_updated = Utc::now();
        self.put_json(&conversation_key(conversation), &record)
    }

    /// Append one message to a conversation's record, creating the record if
    /// this is the first message.  A message whose id is already present is
    /// not appended again.
    ///
    /// The message is stored in its storage form: for an encrypted
    /// conversation the plaintext is stripped and only the envelope remains.
    pub fn append_conversation_message(
        &self,
        conversation: &ConversationId,
        encrypted: bool,
        message: &ChatMessage,
    ) -> Result<()> {
        let mut record = self
            .load_conversation_record(conversation)?
            .unwrap_or_else(|| ConversationRecord::new(encrypted));

        if record.messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }

        record.messages.push(message.storage_form());
        self.save_conversation_record(conversation, &record)
    }

    /// Replace a stored message in place (status transitions).  Messages are
    /// matched by id; a miss is a no-op.
    pub fn update_conversation_message(
        &self,
        conversation: &ConversationId,
        message: &ChatMessage,
    ) -> Result<()> {
        let Some(mut record) = self.load_conversation_record(conversation)? else {
            return Ok(());
        };

        if let Some(slot) = record.messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message.storage_form();
            self.save_conversation_record(conversation, &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullse_shared::model::{MessageStatus, Sender, SenderRole};
    use pullse_shared::types::ClientId;

    fn sender() -> Sender {
        Sender {
            client_id: ClientId::new("visitor-1"),
            display_name: None,
            role: SenderRole::Customer,
        }
    }

    #[test]
    fn test_conversation_list_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let ws = WorkspaceId::new("ws-a");

        assert!(db.load_conversations(&ws).unwrap().is_empty());

        let convs = vec![Conversation::new(ConversationId::new("conv-1"), "Support", false)];
        db.save_conversations(&ws, &convs).unwrap();

        assert_eq!(db.load_conversations(&ws).unwrap(), convs);
    }

    #[test]
    fn test_conversation_lists_are_workspace_scoped() {
        let db = Database::open_in_memory().unwrap();
        let ws_a = WorkspaceId::new("ws-a");
        let ws_b = WorkspaceId::new("ws-b");

        let convs = vec![Conversation::new(ConversationId::new("conv-1"), "Support", false)];
        db.save_conversations(&ws_a, &convs).unwrap();

        assert!(db.load_conversations(&ws_b).unwrap().is_empty());
    }

    #[test]
    fn test_current_conversation_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let ws = WorkspaceId::new("ws-a");
        let conv = ConversationId::new("conv-1");

        assert!(db.load_current_conversation(&ws).unwrap().is_none());
        db.save_current_conversation(&ws, &conv).unwrap();
        assert_eq!(db.load_current_conversation(&ws).unwrap(), Some(conv));
    }

    #[test]
    fn test_append_and_update_message() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        let mut msg = ChatMessage::new(conv.clone(), sender(), "hello");
        db.append_conversation_message(&conv, false, &msg).unwrap();

        let record = db.load_conversation_record(&conv).unwrap().unwrap();
        assert_eq!(record.messages.len(), 1);
        assert_eq!(record.messages[0].status, MessageStatus::Sending);

        msg.status = MessageStatus::Sent;
        db.update_conversation_message(&conv, &msg).unwrap();

        let record = db.load_conversation_record(&conv).unwrap().unwrap();
        assert_eq!(record.messages[0].status, MessageStatus::Sent);
    }
}
