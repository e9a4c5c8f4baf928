use thiserror::Error;

use pullse_realtime::RealtimeError;
use pullse_shared::CryptoError;
use pullse_store::StoreError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Conversation {0} has no encryption key")]
    MissingKey(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
