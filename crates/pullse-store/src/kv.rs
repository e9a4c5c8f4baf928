//! Generic JSON key-value access on the `kv` table.
//!
//! Writers always replace the whole record under a key; there are no partial
//! field updates, so concurrent writers cannot interleave halves of a value.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Fetch and deserialize the value stored under `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Serialize `value` and store it under `key`, replacing any previous
    /// value atomically.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.put_raw(key, &text)
    }

    /// Delete the record under `key`.  Returns `true` if a row was deleted.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    pub(crate) fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub(crate) fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
