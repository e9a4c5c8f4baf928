//! # pullse-realtime
//!
//! Realtime layer of the Pullse chat core: connection lifecycle against the
//! managed pub/sub backend, per-conversation channel operations, presence and
//! typing tracking, and publish rate limiting.
//!
//! The transport is a seam: the production [`transport::ws::WsConnector`]
//! speaks JSON frames over a WebSocket, and
//! [`transport::memory::MemoryBackend`] provides an in-process broker for
//! tests and explicit local development.  Nothing ever falls back between
//! the two silently.

pub mod channels;
pub mod connection;
pub mod presence;
pub mod rate_limit;
pub mod token;
pub mod transport;

mod error;

pub use channels::{ChannelRegistry, ChannelSubscription, PresenceEvent, PresenceSubscription};
pub use connection::{ConnectionManager, ConnectionState, RetryPolicy};
pub use error::RealtimeError;
pub use presence::{PresenceTracker, TypingEvent, TypingWatch};
pub use rate_limit::RateLimiter;
pub use token::TokenClient;
pub use transport::memory::{MemoryBackend, MemoryConnector};
pub use transport::ws::WsConnector;
pub use transport::{Connector, TransportCommand, TransportEvent, TransportHandle};
