//! Process-wide [`SyncStatus`] record.
//!
//! Only the offline queue and the sync coordinator mutate this record, and
//! both go through [`Database::load_sync_status`] /
//! [`Database::save_sync_status`] so every write replaces the whole record.

use pullse_shared::constants::KEY_SYNC_STATUS;
use pullse_shared::model::SyncStatus;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Load the sync status, creating a default record on first use.
    pub fn load_sync_status(&self) -> Result<SyncStatus> {
        Ok(self.get_json(KEY_SYNC_STATUS)?.unwrap_or_default())
    }

    pub fn save_sync_status(&self, status: &SyncStatus) -> Result<()> {
        self.put_json(KEY_SYNC_STATUS, status)
    }

    /// Clear a stale `is_syncing` flag left behind by a crash mid-flush.
    ///
    /// Called once when the client starts; a flush cycle that died with the
    /// process must not wedge every later cycle.
    pub fn reset_stale_sync_flag(&self) -> Result<()> {
        let mut status = self.load_sync_status()?;
        if status.is_syncing {
            tracing::warn!("clearing stale is_syncing flag from a previous session");
            status.is_syncing = false;
            self.save_sync_status(&status)?;
        }
        Ok(())
    }
}
