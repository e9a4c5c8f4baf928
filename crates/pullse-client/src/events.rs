//! Events emitted to the UI layer.
//!
//! The coordinator pushes [`ClientEvent`]s over an unbounded channel; the UI
//! drains it and re-renders.  This replaces DOM event dispatch in the
//! embedded widget.

use tokio::sync::mpsc;

use pullse_realtime::ConnectionState;
use pullse_shared::model::{ChatMessage, Conversation};
use pullse_shared::types::{ClientId, ConversationId, MessageId};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection state transition.
    ConnectionChanged { state: ConnectionState },
    /// A message arrived on a watched conversation.
    MessageReceived {
        conversation_id: ConversationId,
        message: ChatMessage,
    },
    /// An existing message changed (status transition).
    MessageUpdated {
        conversation_id: ConversationId,
        message: ChatMessage,
    },
    /// Conversation metadata changed (preview, unread count).
    ConversationUpdated { conversation: Conversation },
    /// A conversation's offline queue finished flushing.
    QueueFlushed { conversation_id: ConversationId },
    Typing {
        conversation_id: ConversationId,
        client_id: ClientId,
        typing: bool,
    },
    /// A message could not be persisted to the offline queue and may not
    /// send; the in-memory copy is still shown.
    SendWarning {
        conversation_id: ConversationId,
        message_id: MessageId,
        reason: String,
    },
}

/// Emit an event, logging if the UI receiver is gone.
pub(crate) fn emit_event(tx: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    if tx.send(event).is_err() {
        tracing::debug!("no UI listener for client event");
    }
}
