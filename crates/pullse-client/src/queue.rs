//! Offline-first outbound message queue.
//!
//! Messages composed while disconnected are persisted per conversation and
//! replayed in enqueue order once connectivity returns.  Flush is
//! single-flight per conversation, removes an entry from storage only after
//! its publish is acknowledged, and leaves the un-flushed tail intact when a
//! publish fails mid-flush.
//!
//! This module is also the sole writer of the persisted [`SyncStatus`]
//! record; every mutation is a whole-record read-modify-write under one
//! async lock.
//!
//! [`SyncStatus`]: pullse_shared::model::SyncStatus

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use pullse_realtime::{ChannelRegistry, ConnectionManager};
use pullse_shared::constants::EVENT_MESSAGE;
use pullse_shared::model::{ChatMessage, MessageStatus};
use pullse_shared::types::{ConversationId, MessageId};
use pullse_store::Database;

use crate::error::Result;

#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<StdMutex<Database>>,
    registry: ChannelRegistry,
    manager: ConnectionManager,
    /// Conversations with a flush in flight right now.
    flushing: Arc<StdMutex<HashSet<ConversationId>>>,
    /// Serializes every read-modify-write of the sync status record.
    status_lock: Arc<AsyncMutex<()>>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<StdMutex<Database>>,
        registry: ChannelRegistry,
        manager: ConnectionManager,
    ) -> Self {
        Self {
            store,
            registry,
            manager,
            flushing: Arc::new(StdMutex::new(HashSet::new())),
            status_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Persist a message for later delivery and mark its conversation
    /// pending.
    pub async fn enqueue(
        &self,
        conversation: &ConversationId,
        mut message: ChatMessage,
    ) -> Result<MessageId> {
        message.status = MessageStatus::Queued;
        message.queued_at = Some(Utc::now());

        {
            let store = self.store.lock().unwrap();
            store.push_queued_message(conversation, &message)?;
        }

        let _guard = self.status_lock.lock().await;
        let store = self.store.lock().unwrap();
        let mut status = store.load_sync_status()?;
        if status.pending_conversations.insert(conversation.clone()) {
            store.save_sync_status(&status)?;
        }

        info!(conversation = %conversation, message = %message.id, "message queued offline");
        Ok(message.id)
    }

    /// A conversation's queued messages in enqueue order.
    pub fn get_queued(&self, conversation: &ConversationId) -> Result<Vec<ChatMessage>> {
        let store = self.store.lock().unwrap();
        Ok(store.load_queue(conversation)?)
    }

    /// Replay a conversation's queue through the channel registry.
    ///
    /// Returns `Ok(false)` without doing anything when disconnected or when
    /// a flush for this conversation is already in flight; `Ok(true)` once
    /// the queue is fully drained.  A mid-flush publish failure propagates
    /// after leaving the un-flushed remainder in storage; a later retry
    /// picks up exactly there, and already-flushed entries are gone so no
    /// message is ever published twice by this client.
    pub async fn flush(&self, conversation: &ConversationId) -> Result<bool> {
        if !self.manager.is_connected() {
            debug!(conversation = %conversation, "flush skipped: not connected");
            return Ok(false);
        }

        {
            let mut flushing = self.flushing.lock().unwrap();
            if !flushing.insert(conversation.clone()) {
                debug!(conversation = %conversation, "flush skipped: already in progress");
                return Ok(false);
            }
        }

        let result = self.flush_inner(conversation).await;
        self.flushing.lock().unwrap().remove(conversation);
        result
    }

    async fn flush_inner(&self, conversation: &ConversationId) -> Result<bool> {
        let queued = {
            let store = self.store.lock().unwrap();
            store.load_queue(conversation)?
        };

        if queued.is_empty() {
            self.clear_pending(conversation).await?;
            return Ok(true);
        }

        info!(
            conversation = %conversation,
            count = queued.len(),
            "flushing offline queue"
        );

        for message in queued {
            let mut outbound = message.clone();
            outbound.status = MessageStatus::Sent;
            outbound.queued_at = None;

            let payload = serde_json::to_value(outbound.storage_form())?;

            if let Err(e) = self.registry.publish(conversation, EVENT_MESSAGE, payload).await {
                warn!(
                    conversation = %conversation,
                    message = %message.id,
                    error = %e,
                    "flush interrupted, remainder stays queued"
                );
                return Err(e.into());
            }

            // Publish acknowledged: clear the queue entry and the stored
            // status together, so the record never keeps a stale queued
            // marker for a delivered message.
            let store = self.store.lock().unwrap();
            store.remove_queued_message(conversation, message.id)?;
            store.update_conversation_message(conversation, &outbound)?;
        }

        self.clear_pending(conversation).await?;
        info!(conversation = %conversation, "offline queue flushed");
        Ok(true)
    }

    /// Drop a conversation's queue without sending.
    pub async fn clear(&self, conversation: &ConversationId) -> Result<bool> {
        let existed = {
            let store = self.store.lock().unwrap();
            store.clear_queue(conversation)?
        };
        self.clear_pending(conversation).await?;
        Ok(existed)
    }

    /// Conversations with a nonempty offline queue.
    pub async fn pending_conversations(&self) -> Result<BTreeSet<ConversationId>> {
        let _guard = self.status_lock.lock().await;
        let store = self.store.lock().unwrap();
        Ok(store.load_sync_status()?.pending_conversations)
    }

    /// Claim the process-wide sync cycle.  Returns `false` when another
    /// cycle is already running.
    pub async fn begin_sync_cycle(&self) -> Result<bool> {
        let _guard = self.status_lock.lock().await;
        let store = self.store.lock().unwrap();
        let mut status = store.load_sync_status()?;
        if status.is_syncing {
            return Ok(false);
        }
        status.is_syncing = true;
        store.save_sync_status(&status)?;
        Ok(true)
    }

    /// Release the sync cycle and stamp the sync time.
    pub async fn end_sync_cycle(&self) -> Result<()> {
        let _guard = self.status_lock.lock().await;
        let store = self.store.lock().unwrap();
        let mut status = store.load_sync_status()?;
        status.is_syncing = false;
        status.last_sync_time = Some(Utc::now());
        store.save_sync_status(&status)?;
        Ok(())
    }

    async fn clear_pending(&self, conversation: &ConversationId) -> Result<()> {
        let _guard = self.status_lock.lock().await;
        let store = self.store.lock().unwrap();
        let mut status = store.load_sync_status()?;
        if status.pending_conversations.remove(conversation) {
            store.save_sync_status(&status)?;
        }
        Ok(())
    }
}
