use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup expected a record but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored value failed to (de)serialize.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Hex decoding error (conversation key material).
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Stored key material had the wrong length.
    #[error("Invalid key material for conversation {0}")]
    InvalidKeyMaterial(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
