//! v001 -- Initial schema creation.
//!
//! Creates the single `kv` table.  Values are JSON-encoded text; the typed
//! accessor modules own the key naming.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,               -- JSON-encoded record
    updated_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
