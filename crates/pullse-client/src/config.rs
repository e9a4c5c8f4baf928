//! Client configuration loaded from environment variables.
//!
//! All settings except the workspace id have sensible defaults so the widget
//! can start with minimal configuration.

use std::path::PathBuf;

use pullse_shared::types::{ClientId, WorkspaceId};

/// Widget client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Workspace this widget belongs to.
    /// Env: `PULLSE_WORKSPACE_ID`
    pub workspace_id: WorkspaceId,

    /// This client's identity on channels and in presence sets.
    /// Env: `PULLSE_CLIENT_ID`
    pub client_id: ClientId,

    /// Display name announced in presence and typing payloads.
    /// Env: `PULLSE_DISPLAY_NAME`
    /// Default: none.
    pub display_name: Option<String>,

    /// Token endpoint returning `{ "token": "..." }`.
    /// Env: `PULLSE_TOKEN_URL`
    /// Default: `https://api.pullse.io/ably-token`
    pub token_url: String,

    /// WebSocket endpoint of the realtime backend.
    /// Env: `PULLSE_REALTIME_URL`
    /// Default: `wss://realtime.pullse.io/v1`
    pub realtime_url: String,

    /// Origins trusted on the cross-frame bridge.  Frames from any other
    /// origin are discarded silently.
    /// Env: `PULLSE_ALLOWED_ORIGINS` (comma-separated)
    /// Default: the widget and API origins.
    pub allowed_origins: Vec<String>,

    /// Explicit database path.  Default: the platform data directory.
    /// Env: `PULLSE_DB_PATH`
    pub db_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(workspace_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            workspace_id: WorkspaceId::new(workspace_id),
            client_id: ClientId::new(client_id),
            display_name: None,
            token_url: "https://api.pullse.io/ably-token".to_string(),
            realtime_url: "wss://realtime.pullse.io/v1".to_string(),
            allowed_origins: vec![
                "https://widget.pullse.io".to_string(),
                "https://api.pullse.io".to_string(),
            ],
            db_path: None,
        }
    }

    /// Load configuration from environment variables, falling back to
    /// defaults where unset.
    pub fn from_env() -> Self {
        let workspace = std::env::var("PULLSE_WORKSPACE_ID").unwrap_or_default();
        let client = std::env::var("PULLSE_CLIENT_ID").unwrap_or_default();
        let mut config = Self::new(workspace, client);

        if let Ok(name) = std::env::var("PULLSE_DISPLAY_NAME") {
            if !name.is_empty() {
                config.display_name = Some(name);
            }
        }

        if let Ok(url) = std::env::var("PULLSE_TOKEN_URL") {
            config.token_url = url;
        }

        if let Ok(url) = std::env::var("PULLSE_REALTIME_URL") {
            config.realtime_url = url;
        }

        if let Ok(origins) = std::env::var("PULLSE_ALLOWED_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.allowed_origins = parsed;
            }
        }

        if let Ok(path) = std::env::var("PULLSE_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        config
    }
}
