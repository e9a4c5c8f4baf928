//! JSON frames exchanged with the realtime backend, plus the typed payloads
//! carried by channel events.
//!
//! The backend speaks newline-free JSON text frames over a WebSocket.  Every
//! request that expects a reply carries a client-assigned `id` the backend
//! echoes back in the matching `ack` / result frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::PresenceStatus;
use crate::types::{ClientId, MessageId};

/// Payload of `typing:start` / `typing:stop` channel events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub client_id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One member on a channel's presence sub-channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub client_id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Update,
    Leave,
}

/// Frames sent from the client to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientFrame {
    /// First frame on every connection.
    Auth { token: String },
    /// Start receiving events for a channel.
    Attach { channel: String },
    /// Stop receiving events for a channel.
    Detach { channel: String },
    /// Publish an event; acknowledged by an `ack` frame with the same id.
    #[serde(rename_all = "camelCase")]
    Publish {
        id: u64,
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    /// Request paginated history for a channel.
    #[serde(rename_all = "camelCase")]
    History {
        id: u64,
        channel: String,
        limit: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        before_id: Option<MessageId>,
    },
    /// Enter / update / leave the channel's presence set.
    Presence {
        channel: String,
        #[serde(rename = "presenceAction")]
        action: PresenceAction,
        member: PresenceMember,
    },
    /// Request a snapshot of the channel's presence set.
    PresenceGet { id: u64, channel: String },
}

/// Frames sent from the backend to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Auth accepted; the connection is live.
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    /// Reply to `Publish`; `error` is set on failure.
    Ack {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A live event on an attached channel.
    Event {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    /// Reply to `History`; payloads in backend storage order.
    History {
        id: u64,
        messages: Vec<serde_json::Value>,
    },
    /// Reply to `PresenceGet`.
    PresenceState {
        id: u64,
        members: Vec<PresenceMember>,
    },
    /// A live presence transition on an attached channel.
    Presence {
        channel: String,
        #[serde(rename = "presenceAction")]
        action: PresenceAction,
        member: PresenceMember,
    },
    /// Fatal protocol-level error; the backend closes after sending it.
    Error { code: String, message: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
