//! Offline queue storage: one durable FIFO of messages per conversation.
//!
//! The queue under `pullse_offline_messages_<conversationId>` keeps messages
//! in enqueue order.  Removal is by message id so a replayed removal (after a
//! crash between publish ack and storage write) is harmless.

use pullse_shared::constants::KEY_OFFLINE_QUEUE_PREFIX;
use pullse_shared::model::ChatMessage;
use pullse_shared::types::{ConversationId, MessageId};

use crate::database::Database;
use crate::error::Result;

fn queue_key(conversation: &ConversationId) -> String {
    format!("{KEY_OFFLINE_QUEUE_PREFIX}{conversation}")
}

impl Database {
    /// Load a conversation's queued messages in enqueue order.
    pub fn load_queue(&self, conversation: &ConversationId) -> Result<Vec<ChatMessage>> {
        Ok(self.get_json(&queue_key(conversation))?.unwrap_or_default())
    }

    /// Append a message to the tail of a conversation's queue.
    ///
    /// A message whose id is already queued is not appended again.
    pub fn push_queued_message(
        &self,
        conversation: &ConversationId,
        message: &ChatMessage,
    ) -> Result<()> {
        let mut queue = self.load_queue(conversation)?;
        if queue.iter().any(|m| m.id == message.id) {
            tracing::debug!(
                conversation = %conversation,
                message = %message.id,
                "message already queued, skipping"
            );
            return Ok(());
        }
        queue.push(message.storage_form());
        self.put_json(&queue_key(conversation), &queue)
    }

    /// Remove one message from a conversation's queue by id.
    ///
    /// Returns `true` if the message was present.
    pub fn remove_queued_message(
        &self,
        conversation: &ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        let mut queue = self.load_queue(conversation)?;
        let before = queue.len();
        queue.retain(|m| m.id != message_id);

        if queue.len() == before {
            return Ok(false);
        }

        if queue.is_empty() {
            self.delete(&queue_key(conversation))?;
        } else {
            self.put_json(&queue_key(conversation), &queue)?;
        }
        Ok(true)
    }

    /// Drop a conversation's queue entirely.  Returns `true` if one existed.
    pub fn clear_queue(&self, conversation: &ConversationId) -> Result<bool> {
        self.delete(&queue_key(conversation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullse_shared::model::{MessageStatus, Sender, SenderRole};
    use pullse_shared::types::ClientId;

    fn queued(conv: &ConversationId, content: &str) -> ChatMessage {
        let sender = Sender {
            client_id: ClientId::new("visitor-1"),
            display_name: None,
            role: SenderRole::Customer,
        };
        let mut msg = ChatMessage::new(conv.clone(), sender, content);
        msg.status = MessageStatus::Queued;
        msg
    }

    #[test]
    fn test_queue_preserves_enqueue_order() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        for i in 0..5 {
            db.push_queued_message(&conv, &queued(&conv, &format!("m{i}")))
                .unwrap();
        }

        let queue = db.load_queue(&conv).unwrap();
        let contents: Vec<_> = queue.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_push_is_idempotent_by_id() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");
        let msg = queued(&conv, "once");

        db.push_queued_message(&conv, &msg).unwrap();
        db.push_queued_message(&conv, &msg).unwrap();

        assert_eq!(db.load_queue(&conv).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_by_id() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        let first = queued(&conv, "first");
        let second = queued(&conv, "second");
        db.push_queued_message(&conv, &first).unwrap();
        db.push_queued_message(&conv, &second).unwrap();

        assert!(db.remove_queued_message(&conv, first.id).unwrap());
        assert!(!db.remove_queued_message(&conv, first.id).unwrap());

        let queue = db.load_queue(&conv).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, second.id);
    }

    #[test]
    fn test_clear_queue() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::new("conv-1");

        assert!(!db.clear_queue(&conv).unwrap());

        db.push_queued_message(&conv, &queued(&conv, "m")).unwrap();
        assert!(db.clear_queue(&conv).unwrap());
        assert!(db.load_queue(&conv).unwrap().is_empty());
    }
}
