//! Transport seam between the connection manager and the realtime backend.
//!
//! A [`Connector`] opens one logical connection and hands back a
//! [`TransportHandle`]: a command sender and an event receiver.  The transport
//! itself runs in a dedicated tokio task; external code communicates with it
//! only through these typed channels, so a fake transport for tests is just
//! another task speaking the same protocol.
//!
//! There is no silent fallback between connectors.  Which connector a
//! connection manager uses is fixed at construction time and observable via
//! [`Connector::name`]; a failed connect always surfaces as an error.

pub mod memory;
pub mod ws;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use pullse_shared::protocol::{PresenceAction, PresenceMember};
use pullse_shared::types::MessageId;

use crate::error::RealtimeError;

/// Commands sent *into* the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Start receiving events for a channel.
    Attach { channel: String },
    /// Stop receiving events for a channel.
    Detach { channel: String },
    /// Publish an event; the reply resolves once the backend acknowledges.
    Publish {
        channel: String,
        event: String,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    /// Request paginated history for a channel.
    History {
        channel: String,
        limit: u32,
        before_id: Option<MessageId>,
        reply: oneshot::Sender<Result<Vec<serde_json::Value>, RealtimeError>>,
    },
    /// Enter / update / leave the channel's presence set.
    Presence {
        channel: String,
        action: PresenceAction,
        member: PresenceMember,
    },
    /// Request a snapshot of a channel's presence set.
    PresenceGet {
        channel: String,
        reply: oneshot::Sender<Result<Vec<PresenceMember>, RealtimeError>>,
    },
    /// Gracefully close the connection.
    Close,
}

/// Events sent *from* the transport task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A live event on an attached channel.
    Event {
        channel: String,
        event: String,
        payload: serde_json::Value,
    },
    /// A live presence transition on an attached channel.
    Presence {
        channel: String,
        action: PresenceAction,
        member: PresenceMember,
    },
    /// The connection is gone.  The transport task exits after sending this.
    Dropped { reason: String },
}

/// A live connection: commands in, events out.
pub struct TransportHandle {
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to the realtime backend.
///
/// `connect` resolves only once the backend has acknowledged the connection;
/// the connection manager wraps it in the connect timeout.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<TransportHandle, RealtimeError>>;

    /// Short connector name for logs ("websocket", "memory").
    fn name(&self) -> &'static str;
}

/// Capacity of the command channel into a transport task.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 256;
