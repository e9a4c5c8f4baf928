//! Domain model structs for conversations, messages, presence, and sync
//! bookkeeping.
//!
//! Everything here is (de)serialized with serde using the camelCase field
//! names the storage layer and the realtime backend expect, so a struct can
//! be handed to either without translation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::LAST_MESSAGE_PREVIEW_CHARS;
use crate::crypto::CipherEnvelope;
use crate::types::{ClientId, ConversationId, MessageId};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Customer,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub client_id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: SenderRole,
}

/// A file attached to a message.  Attachments are uploaded out of band; the
/// message carries only the reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Delivery lifecycle of an outbound message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
}

/// A single chat message.
///
/// `content` is the plaintext and is always present in memory.  For an
/// encrypted conversation the persisted and transmitted form carries the
/// envelope instead; see [`ChatMessage::storage_form`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<CipherEnvelope>,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// When the message entered the offline queue.  Cleared together with
    /// the `Queued` status on successful flush.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(
        conversation_id: ConversationId,
        sender: Sender,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            sender,
            content: content.into(),
            encrypted_content: None,
            encrypted: false,
            attachments: Vec::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
            queued_at: None,
        }
    }

    /// The form written to storage and published on the wire.
    ///
    /// For an encrypted message the plaintext never leaves memory: the
    /// returned copy carries only the envelope.
    pub fn storage_form(&self) -> Self {
        let mut stored = self.clone();
        if stored.encrypted {
            stored.content = String::new();
        }
        stored
    }

    /// Total-order sort key: timestamp first, message id breaks ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}

/// Sort messages ascending by `(timestamp, id)`.
///
/// Two messages sharing a timestamp still order deterministically, so every
/// reader of the same set sees the same sequence.
pub fn sort_messages(messages: &mut [ChatMessage]) {
    messages.sort_by_key(|m| m.sort_key());
}

/// Truncate plaintext to a conversation-list preview.
pub fn message_preview(content: &str) -> String {
    if content.chars().count() <= LAST_MESSAGE_PREVIEW_CHARS {
        return content.to_string();
    }
    let truncated: String = content.chars().take(LAST_MESSAGE_PREVIEW_CHARS).collect();
    format!("{truncated}…")
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// Decided at creation, immutable once messages exist.
    pub encrypted: bool,
    pub participants: Vec<Sender>,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>, encrypted: bool) -> Self {
        Self {
            id,
            title: title.into(),
            last_message: None,
            last_message_timestamp: None,
            unread_count: 0,
            encrypted,
            participants: Vec::new(),
        }
    }
}

/// Per-conversation storage record (`chat_conversation_<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub messages: Vec<ChatMessage>,
    pub encrypted: bool,
    pub last_updated: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(encrypted: bool) -> Self {
        Self {
            messages: Vec::new(),
            encrypted,
            last_updated: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync bookkeeping
// ---------------------------------------------------------------------------

/// Process-wide sync state (`pullse_sync_status`), persisted across reloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Conversations with a nonempty offline queue.
    #[serde(default)]
    pub pending_conversations: BTreeSet<ConversationId>,
    /// Guards against concurrent flush cycles.
    #[serde(default)]
    pub is_syncing: bool,
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Typing,
}

/// Ephemeral per-client presence state.  Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub client_id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;
    use chrono::TimeZone;

    fn sender() -> Sender {
        Sender {
            client_id: ClientId::new("visitor-1"),
            display_name: Some("Visitor".to_string()),
            role: SenderRole::Customer,
        }
    }

    fn message_at(ts: DateTime<Utc>) -> ChatMessage {
        let mut msg = ChatMessage::new(ConversationId::new("conv-1"), sender(), "hi");
        msg.timestamp = ts;
        msg
    }

    #[test]
    fn test_sort_total_order_on_equal_timestamps() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = message_at(ts);
        let b = message_at(ts);

        let mut forward = vec![a.clone(), b.clone()];
        let mut reverse = vec![b, a];
        sort_messages(&mut forward);
        sort_messages(&mut reverse);

        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_sort_ascending_by_timestamp() {
        let early = message_at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let late = message_at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).unwrap());

        let mut messages = vec![late.clone(), early.clone()];
        sort_messages(&mut messages);

        assert_eq!(messages[0].id, early.id);
        assert_eq!(messages[1].id, late.id);
    }

    #[test]
    fn test_storage_form_strips_plaintext_when_encrypted() {
        let mut msg = message_at(Utc::now());
        msg.encrypted = true;
        msg.encrypted_content = Some(crate::crypto::CipherEnvelope {
            ciphertext: "AAAA".to_string(),
        });

        let stored = msg.storage_form();
        assert!(stored.content.is_empty());
        assert!(stored.encrypted_content.is_some());

        // In-memory copy keeps the plaintext for display.
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn test_storage_form_keeps_plaintext_when_unencrypted() {
        let msg = message_at(Utc::now());
        assert_eq!(msg.storage_form().content, "hi");
    }

    #[test]
    fn test_message_preview_truncates() {
        let short = "hello";
        assert_eq!(message_preview(short), "hello");

        let long = "x".repeat(80);
        let preview = message_preview(&long);
        assert_eq!(preview.chars().count(), LAST_MESSAGE_PREVIEW_CHARS + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_message_preview_multibyte_safe() {
        let long = "é".repeat(60);
        let preview = message_preview(&long);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_message_json_uses_camel_case() {
        let msg = message_at(Utc::now());
        let json = serde_json::to_value(&msg).unwrap();

        assert!(json.get("conversationId").is_some());
        assert!(json.get("queued_at").is_none());
        assert!(json.get("queuedAt").is_none()); // skipped while None
    }

    #[test]
    fn test_sync_status_roundtrip() {
        let mut status = SyncStatus::default();
        status.pending_conversations.insert(ConversationId::new("conv-1"));
        status.is_syncing = true;

        let json = serde_json::to_string(&status).unwrap();
        let back: SyncStatus = serde_json::from_str(&json).unwrap();

        assert_eq!(back, status);
    }
}
