//! In-process transport for tests and explicit local development.
//!
//! [`MemoryBackend`] plays the realtime backend: it keeps per-channel history
//! and presence, delivers published events to every attached connection
//! (including the publisher), and offers failure-injection hooks.  It is
//! never substituted for the WebSocket transport at runtime; selecting it is
//! an explicit configuration choice.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use pullse_shared::constants::EVENT_MESSAGE;
use pullse_shared::protocol::{PresenceAction, PresenceMember};

use crate::error::RealtimeError;
use crate::transport::{
    Connector, TransportCommand, TransportEvent, TransportHandle, COMMAND_CHANNEL_CAPACITY,
};

struct ConnectionSlot {
    events: mpsc::UnboundedSender<TransportEvent>,
    attached: HashSet<String>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BackendInner {
    next_conn: u64,
    connections: HashMap<u64, ConnectionSlot>,
    history: HashMap<String, Vec<serde_json::Value>>,
    presence: HashMap<String, Vec<PresenceMember>>,
    publish_log: Vec<(String, String, serde_json::Value)>,
    fail_publishes: u32,
    publish_failure_plan: VecDeque<bool>,
    refuse_connections: bool,
    connect_count: u32,
    connect_delay: Option<Duration>,
}

/// Shared in-process broker.  Clone freely; all clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Test and inspection hooks
    // ------------------------------------------------------------------

    /// Message-event payloads published on `channel`, in publish order.
    pub fn published(&self, channel: &str) -> Vec<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .publish_log
            .iter()
            .filter(|(c, e, _)| c == channel && e == EVENT_MESSAGE)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    /// Number of publishes of `event` on `channel`.
    pub fn publish_count(&self, channel: &str, event: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .publish_log
            .iter()
            .filter(|(c, e, _)| c == channel && e == event)
            .count()
    }

    /// Inject an event as if a remote peer had published it.
    pub fn emit_event(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        if event == EVENT_MESSAGE {
            inner
                .history
                .entry(channel.to_string())
                .or_default()
                .push(payload.clone());
        }
        deliver(
            &inner,
            channel,
            TransportEvent::Event {
                channel: channel.to_string(),
                event: event.to_string(),
                payload,
            },
        );
    }

    /// Inject a presence transition as if from a remote peer.
    pub fn emit_presence(&self, channel: &str, action: PresenceAction, member: PresenceMember) {
        let mut inner = self.inner.lock().unwrap();
        apply_presence(&mut inner, channel, action, &member);
        deliver(
            &inner,
            channel,
            TransportEvent::Presence {
                channel: channel.to_string(),
                action,
                member,
            },
        );
    }

    /// Pre-populate a channel's history (backend storage order).
    pub fn seed_history(&self, channel: &str, payloads: Vec<serde_json::Value>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .history
            .entry(channel.to_string())
            .or_default()
            .extend(payloads);
    }

    /// Fail the next `n` publishes with [`RealtimeError::PublishFailed`].
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.lock().unwrap().fail_publishes = n;
    }

    /// Script upcoming publish outcomes: one entry per publish, `true` to
    /// fail it.  Publishes beyond the plan succeed.
    pub fn plan_publish_failures(&self, plan: Vec<bool>) {
        self.inner.lock().unwrap().publish_failure_plan = plan.into();
    }

    /// Refuse (or stop refusing) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_connections = refuse;
    }

    /// Delay every connect attempt (for timeout and single-flight tests).
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().connect_delay = delay;
    }

    /// How many connect attempts reached the backend.
    pub fn connect_count(&self) -> u32 {
        self.inner.lock().unwrap().connect_count
    }

    /// Drop every live connection, as if the network went away.
    pub fn drop_connections(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        for (_, slot) in inner.connections.drain() {
            slot.closed.store(true, Ordering::SeqCst);
            let _ = slot.events.send(TransportEvent::Dropped {
                reason: reason.to_string(),
            });
        }
    }

    /// Current presence set of a channel.
    pub fn presence_members(&self, channel: &str) -> Vec<PresenceMember> {
        let inner = self.inner.lock().unwrap();
        inner.presence.get(channel).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------

    fn handle_publish(
        &self,
        channel: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        let mut inner = self.inner.lock().unwrap();

        let planned_failure = inner.publish_failure_plan.pop_front().unwrap_or(false);
        if planned_failure || inner.fail_publishes > 0 {
            if !planned_failure {
                inner.fail_publishes -= 1;
            }
            return Err(RealtimeError::PublishFailed(
                "injected publish failure".to_string(),
            ));
        }

        inner
            .publish_log
            .push((channel.to_string(), event.to_string(), payload.clone()));

        if event == EVENT_MESSAGE {
            inner
                .history
                .entry(channel.to_string())
                .or_default()
                .push(payload.clone());
        }

        deliver(
            &inner,
            channel,
            TransportEvent::Event {
                channel: channel.to_string(),
                event: event.to_string(),
                payload,
            },
        );
        Ok(())
    }

    fn history_for(&self, channel: &str, limit: u32) -> Vec<serde_json::Value> {
        // The paging cursor is ignored here; tests page via `limit` only.
        let inner = self.inner.lock().unwrap();
        let all = inner.history.get(channel).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit as usize);
        all.into_iter().skip(skip).collect()
    }

    fn attach(&self, conn_id: u64, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.connections.get_mut(&conn_id) {
            slot.attached.insert(channel.to_string());
        }
    }

    fn detach(&self, conn_id: u64, channel: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.connections.get_mut(&conn_id) {
            slot.attached.remove(channel);
        }
    }

    fn handle_presence(&self, channel: &str, action: PresenceAction, member: PresenceMember) {
        let mut inner = self.inner.lock().unwrap();
        apply_presence(&mut inner, channel, action, &member);
        deliver(
            &inner,
            channel,
            TransportEvent::Presence {
                channel: channel.to_string(),
                action,
                member,
            },
        );
    }

    fn close_connection(&self, conn_id: u64, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.connections.remove(&conn_id) {
            slot.closed.store(true, Ordering::SeqCst);
            let _ = slot.events.send(TransportEvent::Dropped {
                reason: reason.to_string(),
            });
        }
    }
}

fn apply_presence(
    inner: &mut BackendInner,
    channel: &str,
    action: PresenceAction,
    member: &PresenceMember,
) {
    let members = inner.presence.entry(channel.to_string()).or_default();
    match action {
        PresenceAction::Enter | PresenceAction::Update => {
            match members.iter_mut().find(|m| m.client_id == member.client_id) {
                Some(slot) => *slot = member.clone(),
                None => members.push(member.clone()),
            }
        }
        PresenceAction::Leave => {
            members.retain(|m| m.client_id != member.client_id);
        }
    }
}

fn deliver(inner: &BackendInner, channel: &str, event: TransportEvent) {
    for slot in inner.connections.values() {
        if slot.attached.contains(channel) && !slot.closed.load(Ordering::SeqCst) {
            let _ = slot.events.send(event.clone());
        }
    }
}

/// Connector handing out connections to a shared [`MemoryBackend`].
pub struct MemoryConnector {
    backend: MemoryBackend,
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<TransportHandle, RealtimeError>> {
        async move {
            let delay = self.backend.inner.lock().unwrap().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));

            let conn_id = {
                let mut inner = self.backend.inner.lock().unwrap();
                inner.connect_count += 1;
                if inner.refuse_connections {
                    return Err(RealtimeError::ConnectionFailed {
                        attempts: 1,
                        reason: "connection refused".to_string(),
                    });
                }
                inner.next_conn += 1;
                let conn_id = inner.next_conn;
                inner.connections.insert(
                    conn_id,
                    ConnectionSlot {
                        events: event_tx,
                        attached: HashSet::new(),
                        closed: closed.clone(),
                    },
                );
                conn_id
            };

            tokio::spawn(serve_connection(
                self.backend.clone(),
                conn_id,
                cmd_rx,
                closed,
            ));

            Ok(TransportHandle {
                commands: cmd_tx,
                events: event_rx,
            })
        }
        .boxed()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

async fn serve_connection(
    backend: MemoryBackend,
    conn_id: u64,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    closed: Arc<AtomicBool>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        if closed.load(Ordering::SeqCst) {
            reject_closed(cmd);
            continue;
        }

        match cmd {
            TransportCommand::Close => {
                backend.close_connection(conn_id, "closed by client");
                break;
            }
            TransportCommand::Attach { channel } => backend.attach(conn_id, &channel),
            TransportCommand::Detach { channel } => backend.detach(conn_id, &channel),
            TransportCommand::Publish {
                channel,
                event,
                payload,
                reply,
            } => {
                let _ = reply.send(backend.handle_publish(&channel, &event, payload));
            }
            TransportCommand::History {
                channel,
                limit,
                before_id: _,
                reply,
            } => {
                let _ = reply.send(Ok(backend.history_for(&channel, limit)));
            }
            TransportCommand::Presence {
                channel,
                action,
                member,
            } => backend.handle_presence(&channel, action, member),
            TransportCommand::PresenceGet { channel, reply } => {
                let _ = reply.send(Ok(backend.presence_members(&channel)));
            }
        }
    }

    debug!(conn = conn_id, "memory transport task ended");
}

fn reject_closed(cmd: TransportCommand) {
    match cmd {
        TransportCommand::Publish { reply, .. } => {
            let _ = reply.send(Err(RealtimeError::TransportClosed));
        }
        TransportCommand::History { reply, .. } => {
            let _ = reply.send(Err(RealtimeError::TransportClosed));
        }
        TransportCommand::PresenceGet { reply, .. } => {
            let _ = reply.send(Err(RealtimeError::TransportClosed));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    async fn connect(backend: &MemoryBackend) -> TransportHandle {
        backend.connector().connect("test-token").await.unwrap()
    }

    async fn publish(
        handle: &TransportHandle,
        channel: &str,
        payload: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(TransportCommand::Publish {
                channel: channel.to_string(),
                event: EVENT_MESSAGE.to_string(),
                payload,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_echoes_to_attached_publisher() {
        let backend = MemoryBackend::new();
        let mut handle = connect(&backend).await;

        handle
            .commands
            .send(TransportCommand::Attach {
                channel: "ws:conversations:c1".to_string(),
            })
            .await
            .unwrap();

        publish(&handle, "ws:conversations:c1", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        match handle.events.recv().await {
            Some(TransportEvent::Event { payload, .. }) => {
                assert_eq!(payload, serde_json::json!({"n": 1}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let backend = MemoryBackend::new();
        let handle = connect(&backend).await;

        backend.fail_next_publishes(1);

        let err = publish(&handle, "ch", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::PublishFailed(_)));

        publish(&handle, "ch", serde_json::json!({})).await.unwrap();
        assert_eq!(backend.published("ch").len(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_emits_dropped() {
        let backend = MemoryBackend::new();
        let mut handle = connect(&backend).await;

        backend.drop_connections("network gone");

        match handle.events.recv().await {
            Some(TransportEvent::Dropped { reason }) => assert_eq!(reason, "network gone"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_limit_keeps_latest() {
        let backend = MemoryBackend::new();
        backend.seed_history(
            "ch",
            vec![
                serde_json::json!({"n": 1}),
                serde_json::json!({"n": 2}),
                serde_json::json!({"n": 3}),
            ],
        );

        let handle = connect(&backend).await;
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(TransportCommand::History {
                channel: "ch".to_string(),
                limit: 2,
                before_id: None,
                reply: tx,
            })
            .await
            .unwrap();

        let messages = rx.await.unwrap().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], serde_json::json!({"n": 2}));
    }
}
