//! # pullse-store
//!
//! Local persistence for the Pullse chat core, backed by SQLite.
//!
//! Persistence is a key-value map of JSON-encoded records that survives
//! process reloads, so the schema is a single `kv` table; the modules in
//! this crate layer typed accessors for each storage key on top
//! (conversation lists, per-conversation message records, offline queues,
//! conversation keys, and the process-wide sync status).

pub mod conversations;
pub mod database;
pub mod keys;
pub mod kv;
pub mod migrations;
pub mod queue;
pub mod sync_status;

mod error;

pub use database::Database;
pub use error::StoreError;
