//! Per-conversation channel operations: publish, subscribe, history, and
//! presence.
//!
//! One dispatch task drains the connection manager's event stream and routes
//! events to subscribers in arrival order; the registry never reorders live
//! events.  History reads are sorted client-side into the `(timestamp, id)`
//! total order.  Deduplication by message id is the caller's job (the sync
//! coordinator keeps the per-conversation known set).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use pullse_shared::constants::{EVENT_MESSAGE, MESSAGE_PUBLISH_BURST, MESSAGE_PUBLISH_RATE};
use pullse_shared::model::{sort_messages, ChatMessage, PresenceStatus};
use pullse_shared::protocol::{PresenceAction, PresenceMember};
use pullse_shared::types::{ClientId, ConversationId, MessageId, WorkspaceId};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::RealtimeError;
use crate::rate_limit::RateLimiter;
use crate::transport::{TransportCommand, TransportEvent};

/// A live presence transition observed on a channel.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub member: PresenceMember,
}

type EventKey = (String, String);

#[derive(Default)]
struct SubscriberMap {
    events: HashMap<EventKey, Vec<(u64, mpsc::UnboundedSender<serde_json::Value>)>>,
    presence: HashMap<String, Vec<(u64, mpsc::UnboundedSender<PresenceEvent>)>>,
}

struct RegistryInner {
    workspace: WorkspaceId,
    manager: ConnectionManager,
    message_limiter: RateLimiter,
    subs: StdMutex<SubscriberMap>,
    next_sub_id: AtomicU64,
}

#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    /// Build the registry on top of a connection manager.
    ///
    /// Takes the manager's event stream; one registry per manager.
    pub fn new(workspace: WorkspaceId, manager: ConnectionManager) -> Self {
        let inner = Arc::new(RegistryInner {
            workspace,
            message_limiter: RateLimiter::new(MESSAGE_PUBLISH_RATE, MESSAGE_PUBLISH_BURST),
            subs: StdMutex::new(SubscriberMap::default()),
            next_sub_id: AtomicU64::new(1),
            manager: manager.clone(),
        });

        match manager.take_events() {
            Some(events) => {
                tokio::spawn(dispatch(Arc::downgrade(&inner), events));
            }
            None => {
                warn!("connection manager event stream already taken; live events disabled");
            }
        }
        tokio::spawn(reattach_on_connect(
            Arc::downgrade(&inner),
            manager.state_changes(),
        ));

        Self { inner }
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.inner.workspace
    }

    fn channel(&self, conversation: &ConversationId) -> String {
        conversation.channel_name(&self.inner.workspace)
    }

    /// Publish an event on a conversation's channel and wait for the
    /// backend's acknowledgment.
    ///
    /// Chat messages are rate limited per conversation; the limiter delays
    /// rather than drops, so publish order is preserved.
    pub async fn publish(
        &self,
        conversation: &ConversationId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        if event == EVENT_MESSAGE {
            self.inner
                .message_limiter
                .acquire(conversation.as_str())
                .await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .manager
            .command(TransportCommand::Publish {
                channel: self.channel(conversation),
                event: event.to_string(),
                payload,
                reply: reply_tx,
            })
            .await?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::TransportClosed),
        }
    }

    /// Subscribe to one event on a conversation's channel.
    ///
    /// Dropping the returned subscription unsubscribes; an in-flight publish
    /// or flush is never cancelled by it.
    pub fn subscribe(&self, conversation: &ConversationId, event: &str) -> ChannelSubscription {
        let channel = self.channel(conversation);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut subs = self.inner.subs.lock().unwrap();
            subs.events
                .entry((channel.clone(), event.to_string()))
                .or_default()
                .push((id, tx));
        }
        self.spawn_attach(channel.clone());

        ChannelSubscription {
            inner: self.inner.clone(),
            channel,
            event: event.to_string(),
            id,
            rx,
        }
    }

    /// Subscribe to a channel's presence transitions.
    pub fn subscribe_presence(&self, conversation: &ConversationId) -> PresenceSubscription {
        let channel = self.channel(conversation);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut subs = self.inner.subs.lock().unwrap();
            subs.presence.entry(channel.clone()).or_default().push((id, tx));
        }
        self.spawn_attach(channel.clone());

        PresenceSubscription {
            inner: self.inner.clone(),
            channel,
            id,
            rx,
        }
    }

    /// Paginated history, sorted ascending by `(timestamp, id)`.
    ///
    /// Two messages sharing a timestamp order by id, so every reader sees
    /// the same total order.  Malformed payloads are skipped.
    pub async fn history(
        &self,
        conversation: &ConversationId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>, RealtimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .manager
            .command(TransportCommand::History {
                channel: self.channel(conversation),
                limit,
                before_id,
                reply: reply_tx,
            })
            .await?;

        let payloads = reply_rx
            .await
            .map_err(|_| RealtimeError::TransportClosed)??;

        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_value::<ChatMessage>(payload) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "skipping malformed history entry");
                }
            }
        }

        sort_messages(&mut messages);
        Ok(messages)
    }

    pub async fn enter_presence(
        &self,
        conversation: &ConversationId,
        member: PresenceMember,
    ) -> Result<(), RealtimeError> {
        self.presence(conversation, PresenceAction::Enter, member).await
    }

    pub async fn update_presence(
        &self,
        conversation: &ConversationId,
        member: PresenceMember,
    ) -> Result<(), RealtimeError> {
        self.presence(conversation, PresenceAction::Update, member).await
    }

    pub async fn leave_presence(
        &self,
        conversation: &ConversationId,
        client_id: ClientId,
    ) -> Result<(), RealtimeError> {
        let member = PresenceMember {
            client_id,
            display_name: None,
            status: PresenceStatus::Online,
            last_seen: Some(Utc::now()),
        };
        self.presence(conversation, PresenceAction::Leave, member).await
    }

    /// Snapshot of the channel's current presence set.
    pub async fn get_present(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<PresenceMember>, RealtimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .manager
            .command(TransportCommand::PresenceGet {
                channel: self.channel(conversation),
                reply: reply_tx,
            })
            .await?;

        reply_rx.await.map_err(|_| RealtimeError::TransportClosed)?
    }

    async fn presence(
        &self,
        conversation: &ConversationId,
        action: PresenceAction,
        member: PresenceMember,
    ) -> Result<(), RealtimeError> {
        self.inner
            .manager
            .command(TransportCommand::Presence {
                channel: self.channel(conversation),
                action,
                member,
            })
            .await
    }

    /// Attach the channel if a connection is live; the reattach task covers
    /// the disconnected case on the next connect.
    fn spawn_attach(&self, channel: String) {
        let manager = self.inner.manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.command(TransportCommand::Attach { channel }).await {
                debug!(error = %e, "attach deferred until connected");
            }
        });
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        let subs = self.inner.subs.lock().unwrap();
        subs.events.values().map(Vec::len).sum::<usize>()
            + subs.presence.values().map(Vec::len).sum::<usize>()
    }
}

/// Route live transport events to subscribers, in arrival order.
async fn dispatch(
    weak: Weak<RegistryInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { return };
        let mut subs = inner.subs.lock().unwrap();

        match event {
            TransportEvent::Event {
                channel,
                event,
                payload,
            } => {
                if let Some(senders) = subs.events.get_mut(&(channel, event)) {
                    senders.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
                }
            }
            TransportEvent::Presence {
                channel,
                action,
                member,
            } => {
                if let Some(senders) = subs.presence.get_mut(&channel) {
                    senders.retain(|(_, tx)| {
                        tx.send(PresenceEvent {
                            action,
                            member: member.clone(),
                        })
                        .is_ok()
                    });
                }
            }
            TransportEvent::Dropped { .. } => {
                // The connection manager owns drop handling.
            }
        }
    }
}

/// Re-attach every subscribed channel after a (re)connect, so subscriptions
/// survive connection churn.
async fn reattach_on_connect(
    weak: Weak<RegistryInner>,
    mut states: watch::Receiver<ConnectionState>,
) {
    while states.changed().await.is_ok() {
        if *states.borrow() != ConnectionState::Connected {
            continue;
        }
        let Some(inner) = weak.upgrade() else { return };

        let channels: Vec<String> = {
            let subs = inner.subs.lock().unwrap();
            subs.events
                .keys()
                .map(|(channel, _)| channel.clone())
                .chain(subs.presence.keys().cloned())
                .collect()
        };

        for channel in channels {
            let _ = inner
                .manager
                .command(TransportCommand::Attach { channel })
                .await;
        }
    }
}

pub struct ChannelSubscription {
    inner: Arc<RegistryInner>,
    channel: String,
    event: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl ChannelSubscription {
    /// Next live payload, in arrival order.  `None` once unsubscribed from
    /// the other side (registry gone).
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        let mut subs = self.inner.subs.lock().unwrap();
        let key = (self.channel.clone(), self.event.clone());
        if let Some(senders) = subs.events.get_mut(&key) {
            senders.retain(|(id, _)| *id != self.id);
            if senders.is_empty() {
                subs.events.remove(&key);
            }
        }
    }
}

pub struct PresenceSubscription {
    inner: Arc<RegistryInner>,
    channel: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<PresenceEvent>,
}

impl PresenceSubscription {
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        self.rx.recv().await
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        let mut subs = self.inner.subs.lock().unwrap();
        if let Some(senders) = subs.presence.get_mut(&self.channel) {
            senders.retain(|(id, _)| *id != self.id);
            if senders.is_empty() {
                subs.presence.remove(&self.channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RetryPolicy;
    use crate::token::TokenClient;
    use crate::transport::memory::MemoryBackend;
    use pullse_shared::model::{Sender, SenderRole};
    use std::time::Duration;

    async fn registry(backend: &MemoryBackend, workspace: &str) -> ChannelRegistry {
        let manager = ConnectionManager::new(
            Arc::new(backend.connector()),
            TokenClient::fixed("test-token"),
            RetryPolicy {
                connect_timeout: Duration::from_millis(100),
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_attempts: 3,
            },
        );
        manager.connect().await.unwrap();
        ChannelRegistry::new(WorkspaceId::new(workspace), manager)
    }

    fn chat_message(conversation: &str, content: &str) -> ChatMessage {
        let sender = Sender {
            client_id: ClientId::new("visitor-1"),
            display_name: None,
            role: SenderRole::Customer,
        };
        ChatMessage::new(ConversationId::new(conversation), sender, content)
    }

    #[tokio::test]
    async fn test_publish_then_receive() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");

        let mut sub = registry.subscribe(&conv, EVENT_MESSAGE);
        tokio::time::sleep(Duration::from_millis(20)).await; // let attach land

        registry
            .publish(&conv, EVENT_MESSAGE, serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let payload = sub.recv().await.unwrap();
        assert_eq!(payload, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let backend = MemoryBackend::new();
        let registry_a = registry(&backend, "ws-a").await;
        let registry_b = registry(&backend, "ws-b").await;
        let conv = ConversationId::new("conv-1");

        let mut sub_b = registry_b.subscribe(&conv, EVENT_MESSAGE);
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry_a
            .publish(&conv, EVENT_MESSAGE, serde_json::json!({"from": "a"}))
            .await
            .unwrap();

        // ws-b's subscriber must see nothing from ws-a's channel.
        let outcome =
            tokio::time::timeout(Duration::from_millis(50), sub_b.recv()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_history_sorted_by_timestamp_then_id() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");
        let channel = conv.channel_name(&WorkspaceId::new("ws-a"));

        let mut older = chat_message("conv-1", "older");
        let mut newer = chat_message("conv-1", "newer");
        let ts = Utc::now();
        older.timestamp = ts - chrono::Duration::seconds(5);
        newer.timestamp = ts;

        // Seed newest-first to prove the registry re-sorts.
        backend.seed_history(
            &channel,
            vec![
                serde_json::to_value(newer.storage_form()).unwrap(),
                serde_json::to_value(older.storage_form()).unwrap(),
            ],
        );

        let history = registry.history(&conv, 50, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "older");
        assert_eq!(history[1].content, "newer");
    }

    #[tokio::test]
    async fn test_history_skips_malformed_entries() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");
        let channel = conv.channel_name(&WorkspaceId::new("ws-a"));

        backend.seed_history(
            &channel,
            vec![
                serde_json::json!({"garbage": true}),
                serde_json::to_value(chat_message("conv-1", "ok").storage_form()).unwrap(),
            ],
        );

        let history = registry.history(&conv, 50, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "ok");
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");

        backend.fail_next_publishes(1);
        let err = registry
            .publish(&conv, EVENT_MESSAGE, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");

        let sub = registry.subscribe(&conv, EVENT_MESSAGE);
        assert_eq!(registry.subscriber_count(), 1);

        drop(sub);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_presence_enter_and_get() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, "ws-a").await;
        let conv = ConversationId::new("conv-1");

        registry
            .enter_presence(
                &conv,
                PresenceMember {
                    client_id: ClientId::new("agent-9"),
                    display_name: Some("Dana".to_string()),
                    status: PresenceStatus::Online,
                    last_seen: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let present = registry.get_present(&conv).await.unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].client_id, ClientId::new("agent-9"));

        registry
            .leave_presence(&conv, ClientId::new("agent-9"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.get_present(&conv).await.unwrap().is_empty());
    }
}
