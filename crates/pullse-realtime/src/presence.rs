//! Live typing and presence tracking.
//!
//! Per (conversation, client) pair the typing state machine is
//! `idle -> typing -> idle`, driven by `typing:start` / `typing:stop` channel
//! events.  A sweeper task additionally expires a `typing` record back to
//! idle when no refresh arrives within the TTL, so a lost stop event can
//! never leave a stale indicator on screen.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use pullse_shared::constants::{
    EVENT_TYPING_START, EVENT_TYPING_STOP, TYPING_PUBLISH_BURST, TYPING_PUBLISH_RATE,
    TYPING_TTL_MS,
};
use pullse_shared::model::{PresenceRecord, PresenceStatus};
use pullse_shared::protocol::TypingPayload;
use pullse_shared::types::{ClientId, ConversationId};

use crate::channels::ChannelRegistry;
use crate::error::RealtimeError;
use crate::rate_limit::RateLimiter;

/// Typing transitions delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingEvent {
    Started {
        client_id: ClientId,
        name: Option<String>,
    },
    Stopped {
        client_id: ClientId,
    },
}

struct TypingEntry {
    name: Option<String>,
    started: DateTime<Utc>,
    expires_at: Instant,
}

struct TrackerInner {
    registry: ChannelRegistry,
    ttl: Duration,
    throttle: RateLimiter,
    typing: StdMutex<HashMap<(ConversationId, ClientId), TypingEntry>>,
    watchers: StdMutex<HashMap<ConversationId, Vec<(u64, mpsc::UnboundedSender<TypingEvent>)>>>,
    routers: StdMutex<HashSet<ConversationId>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<TrackerInner>,
}

impl PresenceTracker {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self::with_ttl(registry, Duration::from_millis(TYPING_TTL_MS))
    }

    /// Tracker with an explicit TTL; tests shrink it.
    pub fn with_ttl(registry: ChannelRegistry, ttl: Duration) -> Self {
        let inner = Arc::new(TrackerInner {
            registry,
            ttl,
            throttle: RateLimiter::new(TYPING_PUBLISH_RATE, TYPING_PUBLISH_BURST),
            typing: StdMutex::new(HashMap::new()),
            watchers: StdMutex::new(HashMap::new()),
            routers: StdMutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(sweep_loop(Arc::downgrade(&inner), ttl));

        Self { inner }
    }

    /// Announce that `client_id` started (or keeps) typing.
    ///
    /// Refreshes are throttled per (conversation, client); dropping an
    /// over-rate refresh is safe because the previous one is still within
    /// the TTL.
    pub async fn start_typing(
        &self,
        conversation: &ConversationId,
        client_id: &ClientId,
        name: Option<String>,
    ) -> Result<(), RealtimeError> {
        let key = format!("{conversation}:{client_id}");
        if !self.inner.throttle.check(&key).await {
            trace!(conversation = %conversation, client = %client_id, "typing refresh throttled");
            return Ok(());
        }

        let payload = TypingPayload {
            client_id: client_id.clone(),
            name,
            timestamp: Utc::now(),
        };
        let payload =
            serde_json::to_value(&payload).map_err(|e| RealtimeError::Protocol(e.to_string()))?;

        self.inner
            .registry
            .publish(conversation, EVENT_TYPING_START, payload)
            .await
    }

    /// Announce that `client_id` stopped typing.  Never throttled.
    pub async fn stop_typing(
        &self,
        conversation: &ConversationId,
        client_id: &ClientId,
    ) -> Result<(), RealtimeError> {
        let payload = TypingPayload {
            client_id: client_id.clone(),
            name: None,
            timestamp: Utc::now(),
        };
        let payload =
            serde_json::to_value(&payload).map_err(|e| RealtimeError::Protocol(e.to_string()))?;

        self.inner
            .registry
            .publish(conversation, EVENT_TYPING_STOP, payload)
            .await
    }

    /// Watch typing transitions for one conversation.
    ///
    /// Dropping the returned watch unsubscribes.
    pub fn watch_typing(&self, conversation: &ConversationId) -> TypingWatch {
        self.ensure_router(conversation);

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .watchers
            .lock()
            .unwrap()
            .entry(conversation.clone())
            .or_default()
            .push((id, tx));

        TypingWatch {
            inner: self.inner.clone(),
            conversation: conversation.clone(),
            id,
            rx,
        }
    }

    /// Clients currently typing in a conversation.
    pub fn typing_snapshot(&self, conversation: &ConversationId) -> Vec<PresenceRecord> {
        let now = Instant::now();
        let typing = self.inner.typing.lock().unwrap();
        typing
            .iter()
            .filter(|((conv, _), entry)| conv == conversation && entry.expires_at > now)
            .map(|((_, client_id), entry)| PresenceRecord {
                client_id: client_id.clone(),
                display_name: entry.name.clone(),
                status: PresenceStatus::Typing,
                timestamp: entry.started,
            })
            .collect()
    }

    /// Members currently present on a conversation's channel.
    pub async fn get_present(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<PresenceRecord>, RealtimeError> {
        let members = self.inner.registry.get_present(conversation).await?;
        Ok(members
            .into_iter()
            .map(|m| PresenceRecord {
                client_id: m.client_id,
                display_name: m.display_name,
                status: m.status,
                timestamp: m.last_seen.unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Spawn the routing task for a conversation on first interest.
    fn ensure_router(&self, conversation: &ConversationId) {
        let newly = self.inner.routers.lock().unwrap().insert(conversation.clone());
        if !newly {
            return;
        }

        let starts = self.inner.registry.subscribe(conversation, EVENT_TYPING_START);
        let stops = self.inner.registry.subscribe(conversation, EVENT_TYPING_STOP);
        tokio::spawn(route_loop(
            Arc::downgrade(&self.inner),
            conversation.clone(),
            starts,
            stops,
        ));
    }
}

/// Route typing events for one conversation into the shared map, notifying
/// watchers on state transitions only.
async fn route_loop(
    weak: Weak<TrackerInner>,
    conversation: ConversationId,
    mut starts: crate::channels::ChannelSubscription,
    mut stops: crate::channels::ChannelSubscription,
) {
    loop {
        tokio::select! {
            payload = starts.recv() => {
                let Some(payload) = payload else { break };
                let Ok(typing) = serde_json::from_value::<TypingPayload>(payload) else {
                    debug!(conversation = %conversation, "malformed typing:start payload");
                    continue;
                };
                let Some(inner) = weak.upgrade() else { return };

                let started = {
                    let mut map = inner.typing.lock().unwrap();
                    let key = (conversation.clone(), typing.client_id.clone());
                    let fresh = !map.contains_key(&key);
                    map.insert(key, TypingEntry {
                        name: typing.name.clone(),
                        started: typing.timestamp,
                        expires_at: Instant::now() + inner.ttl,
                    });
                    fresh
                };

                if started {
                    notify(&inner, &conversation, TypingEvent::Started {
                        client_id: typing.client_id,
                        name: typing.name,
                    });
                }
            }
            payload = stops.recv() => {
                let Some(payload) = payload else { break };
                let Ok(typing) = serde_json::from_value::<TypingPayload>(payload) else {
                    debug!(conversation = %conversation, "malformed typing:stop payload");
                    continue;
                };
                let Some(inner) = weak.upgrade() else { return };

                let removed = inner
                    .typing
                    .lock()
                    .unwrap()
                    .remove(&(conversation.clone(), typing.client_id.clone()))
                    .is_some();

                if removed {
                    notify(&inner, &conversation, TypingEvent::Stopped {
                        client_id: typing.client_id,
                    });
                }
            }
        }
    }
}

/// Expire stale typing records back to idle.
async fn sweep_loop(weak: Weak<TrackerInner>, ttl: Duration) {
    let period = (ttl / 5).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else { return };

        let now = Instant::now();
        let expired: Vec<(ConversationId, ClientId)> = {
            let mut map = inner.typing.lock().unwrap();
            let keys: Vec<_> = map
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                map.remove(key);
            }
            keys
        };

        for (conversation, client_id) in expired {
            debug!(conversation = %conversation, client = %client_id, "typing record expired");
            notify(&inner, &conversation, TypingEvent::Stopped { client_id });
        }
    }
}

fn notify(inner: &TrackerInner, conversation: &ConversationId, event: TypingEvent) {
    let mut watchers = inner.watchers.lock().unwrap();
    if let Some(senders) = watchers.get_mut(conversation) {
        senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

pub struct TypingWatch {
    inner: Arc<TrackerInner>,
    conversation: ConversationId,
    id: u64,
    rx: mpsc::UnboundedReceiver<TypingEvent>,
}

impl TypingWatch {
    pub async fn recv(&mut self) -> Option<TypingEvent> {
        self.rx.recv().await
    }
}

impl Drop for TypingWatch {
    fn drop(&mut self) {
        let mut watchers = self.inner.watchers.lock().unwrap();
        if let Some(senders) = watchers.get_mut(&self.conversation) {
            senders.retain(|(id, _)| *id != self.id);
            if senders.is_empty() {
                watchers.remove(&self.conversation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, RetryPolicy};
    use crate::token::TokenClient;
    use crate::transport::memory::MemoryBackend;
    use pullse_shared::types::WorkspaceId;

    async fn tracker(backend: &MemoryBackend, ttl: Duration) -> PresenceTracker {
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
        let registry = ChannelRegistry::new(WorkspaceId::new("ws-a"), manager);
        PresenceTracker::with_ttl(registry, ttl)
    }

    fn typing_json(client: &str, name: Option<&str>) -> serde_json::Value {
        serde_json::to_value(TypingPayload {
            client_id: ClientId::new(client),
            name: name.map(String::from),
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    const CHANNEL: &str = "ws-a:conversations:conv-1";

    #[tokio::test]
    async fn test_start_then_stop() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend, Duration::from_secs(5)).await;
        let conv = ConversationId::new("conv-1");

        let mut watch = tracker.watch_typing(&conv);
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.emit_event(CHANNEL, EVENT_TYPING_START, typing_json("agent-9", Some("Dana")));
        assert_eq!(
            watch.recv().await.unwrap(),
            TypingEvent::Started {
                client_id: ClientId::new("agent-9"),
                name: Some("Dana".to_string()),
            }
        );
        assert_eq!(tracker.typing_snapshot(&conv).len(), 1);

        backend.emit_event(CHANNEL, EVENT_TYPING_STOP, typing_json("agent-9", None));
        assert_eq!(
            watch.recv().await.unwrap(),
            TypingEvent::Stopped {
                client_id: ClientId::new("agent-9"),
            }
        );
        assert!(tracker.typing_snapshot(&conv).is_empty());
    }

    #[tokio::test]
    async fn test_typing_expires_without_stop() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend, Duration::from_millis(50)).await;
        let conv = ConversationId::new("conv-1");

        let mut watch = tracker.watch_typing(&conv);
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.emit_event(CHANNEL, EVENT_TYPING_START, typing_json("agent-9", None));
        assert!(matches!(
            watch.recv().await.unwrap(),
            TypingEvent::Started { .. }
        ));

        // No stop event: the TTL sweeper must expire the record.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.typing_snapshot(&conv).is_empty());
        assert_eq!(
            watch.recv().await.unwrap(),
            TypingEvent::Stopped {
                client_id: ClientId::new("agent-9"),
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl_without_renotifying() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend, Duration::from_millis(80)).await;
        let conv = ConversationId::new("conv-1");

        let mut watch = tracker.watch_typing(&conv);
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.emit_event(CHANNEL, EVENT_TYPING_START, typing_json("agent-9", None));
        watch.recv().await.unwrap();

        // Refresh halfway through the TTL.
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.emit_event(CHANNEL, EVENT_TYPING_START, typing_json("agent-9", None));

        // Past the original deadline the record is still alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.typing_snapshot(&conv).len(), 1);
    }

    #[tokio::test]
    async fn test_start_typing_is_throttled() {
        let backend = MemoryBackend::new();
        let tracker = tracker(&backend, Duration::from_secs(5)).await;
        let conv = ConversationId::new("conv-1");

        for _ in 0..6 {
            tracker
                .start_typing(&conv, &ClientId::new("visitor-1"), None)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let published = backend.publish_count(CHANNEL, EVENT_TYPING_START);
        assert!(published <= 2, "expected throttling, got {published} publishes");
    }
}
