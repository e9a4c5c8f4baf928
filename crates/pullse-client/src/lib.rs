//! # pullse-client
//!
//! Client-side core of the Pullse chat widget: offline-first message queue,
//! per-conversation encryption, the sync coordinator UI code talks to, and
//! the cross-frame bridge to the embedding page.

use std::sync::{Arc, Mutex};

use pullse_realtime::{
    ChannelRegistry, ConnectionManager, Connector, RetryPolicy, TokenClient, WsConnector,
};
use pullse_store::Database;

pub mod bridge;
pub mod config;
pub mod encryption;
pub mod events;
pub mod queue;
pub mod sync;

mod error;

pub use bridge::{BridgeAction, HostBridge, WidgetOptions};
pub use config::ClientConfig;
pub use encryption::EncryptionService;
pub use error::ClientError;
pub use events::ClientEvent;
pub use queue::OfflineQueue;
pub use sync::SyncCoordinator;

/// Wire up a full client over an explicit connector.
///
/// Tests and local development pass a memory connector here; there is no
/// fallback between transports at runtime.
pub fn build_client(
    config: &ClientConfig,
    connector: Arc<dyn Connector>,
) -> Result<SyncCoordinator, ClientError> {
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store = Arc::new(Mutex::new(database));

    let manager = ConnectionManager::new(
        connector,
        TokenClient::new(config.token_url.clone()),
        RetryPolicy::default(),
    );
    let registry = ChannelRegistry::new(config.workspace_id.clone(), manager.clone());

    SyncCoordinator::new(config, store, manager, registry)
}

/// Wire up the production client over the WebSocket transport.
pub fn build_ws_client(config: &ClientConfig) -> Result<SyncCoordinator, ClientError> {
    build_client(config, Arc::new(WsConnector::new(config.realtime_url.clone())))
}
