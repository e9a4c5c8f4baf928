use thiserror::Error;

/// Errors produced by the realtime layer.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// No "connected" acknowledgment arrived within the connect timeout.
    #[error("Connection attempt timed out")]
    ConnectionTimeout,

    /// The connection could not be established (or retries are exhausted).
    #[error("Connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    /// Token endpoint returned a non-2xx status or a malformed body.
    #[error("Auth token error: {0}")]
    AuthToken(String),

    /// A publish was rejected or never acknowledged.  Transient; the caller
    /// may retry or route the message to the offline queue.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// An operation requiring a live connection was attempted while
    /// disconnected.
    #[error("Not connected to the realtime backend")]
    NotConnected,

    /// The transport task went away mid-operation.
    #[error("Transport closed")]
    TransportClosed,

    /// Malformed frame or payload.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
