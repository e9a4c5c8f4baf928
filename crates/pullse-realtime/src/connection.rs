//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single logical connection to the realtime
//! backend: token fetch, connect with ack timeout, single-flight connect
//! calls, and automatic reconnection with exponential backoff after an
//! unexpected drop.  State transitions are broadcast over a watch channel;
//! there is no polling API beyond reading the current value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use pullse_shared::constants::{
    CONNECT_TIMEOUT_SECS, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS,
    RECONNECT_MAX_DELAY_SECS,
};

use crate::error::RealtimeError;
use crate::token::TokenClient;
use crate::transport::{Connector, TransportCommand, TransportEvent, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connected,
    Disconnected,
    Failed,
}

/// Connect timeout and reconnection backoff knobs.
///
/// Defaults match the production constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub connect_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(RECONNECT_MAX_DELAY_SECS),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Clonable record of the most recent failed connect attempt, shared with
/// callers that were waiting on the same in-flight attempt.
#[derive(Debug, Clone)]
enum ConnectFailure {
    Timeout,
    Auth(String),
    Failed(String),
}

impl ConnectFailure {
    fn from_error(error: &RealtimeError) -> Self {
        match error {
            RealtimeError::ConnectionTimeout => Self::Timeout,
            RealtimeError::AuthToken(reason) => Self::Auth(reason.clone()),
            other => Self::Failed(other.to_string()),
        }
    }

    fn into_error(self) -> RealtimeError {
        match self {
            Self::Timeout => RealtimeError::ConnectionTimeout,
            Self::Auth(reason) => RealtimeError::AuthToken(reason),
            Self::Failed(reason) => RealtimeError::ConnectionFailed { attempts: 1, reason },
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    tokens: TokenClient,
    policy: RetryPolicy,
    state_tx: watch::Sender<ConnectionState>,
    commands: StdMutex<Option<mpsc::Sender<TransportCommand>>>,
    connect_lock: AsyncMutex<()>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    /// Bumped for every installed transport; a monitor task whose generation
    /// is stale must exit without touching state.
    generation: AtomicU64,
    attempts_started: AtomicU64,
    last_failure: StdMutex<Option<ConnectFailure>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, tokens: TokenClient, policy: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                connector,
                tokens,
                policy,
                state_tx,
                commands: StdMutex::new(None),
                connect_lock: AsyncMutex::new(()),
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                generation: AtomicU64::new(0),
                attempts_started: AtomicU64::new(0),
                last_failure: StdMutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.  Dropping the receiver unsubscribes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Which transport this manager was built with ("websocket", "memory").
    pub fn connector_name(&self) -> &'static str {
        self.inner.connector.name()
    }

    /// Take the live event stream.  Yields `Some` exactly once; the channel
    /// registry consumes it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.event_rx.lock().unwrap().take()
    }

    /// Establish the connection.
    ///
    /// Single-flight: a call made while another attempt is in flight waits
    /// for that attempt and shares its outcome instead of starting a second
    /// one.  After a `Failed` settle the next call starts a fresh attempt.
    pub async fn connect(&self) -> Result<ConnectionState, RealtimeError> {
        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        let attempts_seen = self.inner.attempts_started.load(Ordering::SeqCst);
        let _guard = self.inner.connect_lock.lock().await;

        if self.is_connected() {
            return Ok(ConnectionState::Connected);
        }

        // An attempt completed while we waited on the lock: share its result.
        if self.inner.attempts_started.load(Ordering::SeqCst) > attempts_seen {
            if let Some(failure) = self.inner.last_failure.lock().unwrap().clone() {
                return Err(failure.into_error());
            }
        }

        self.inner.attempts_started.fetch_add(1, Ordering::SeqCst);
        self.inner.state_tx.send_replace(ConnectionState::Initializing);

        match self.establish().await {
            Ok(()) => {
                *self.inner.last_failure.lock().unwrap() = None;
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                *self.inner.last_failure.lock().unwrap() = Some(ConnectFailure::from_error(&e));
                self.inner.state_tx.send_replace(ConnectionState::Failed);
                warn!(error = %e, "connect attempt failed");
                Err(e)
            }
        }
    }

    /// Tear down the connection deliberately.
    pub async fn disconnect(&self) {
        // A new generation silences the monitor of the transport we are
        // about to close, so no auto-reconnect fires.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let commands = self.inner.commands.lock().unwrap().take();
        if let Some(commands) = commands {
            let _ = commands.send(TransportCommand::Close).await;
        }

        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        info!("disconnected from realtime backend");
    }

    /// Send a command to the live transport.
    pub(crate) async fn command(&self, command: TransportCommand) -> Result<(), RealtimeError> {
        let sender = self
            .inner
            .commands
            .lock()
            .unwrap()
            .clone()
            .ok_or(RealtimeError::NotConnected)?;

        sender
            .send(command)
            .await
            .map_err(|_| RealtimeError::TransportClosed)
    }

    /// One full connect: fresh token, transport connect bounded by the ack
    /// timeout, then install the handle.
    async fn establish(&self) -> Result<(), RealtimeError> {
        let token = self.inner.tokens.fetch().await?;

        let handle = tokio::time::timeout(
            self.inner.policy.connect_timeout,
            self.inner.connector.connect(&token),
        )
        .await
        .map_err(|_| RealtimeError::ConnectionTimeout)??;

        self.install(handle);
        self.inner.state_tx.send_replace(ConnectionState::Connected);
        info!(
            transport = self.inner.connector.name(),
            "realtime connection established"
        );
        Ok(())
    }

    fn install(&self, handle: TransportHandle) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.commands.lock().unwrap() = Some(handle.commands);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(monitor(weak, handle.events, generation));
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Automatic reconnection after an unexpected drop.
    async fn reconnect_with_backoff(&self) {
        let policy = self.inner.policy.clone();

        for attempt in 1..=policy.max_attempts {
            let delay = backoff_delay(&policy, attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            if self.is_connected() {
                return;
            }

            let _guard = self.inner.connect_lock.lock().await;
            if self.is_connected() {
                return;
            }

            self.inner.attempts_started.fetch_add(1, Ordering::SeqCst);
            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    *self.inner.last_failure.lock().unwrap() =
                        Some(ConnectFailure::from_error(&e));
                }
            }
        }

        error!(
            attempts = policy.max_attempts,
            "reconnect attempts exhausted"
        );
        self.inner.state_tx.send_replace(ConnectionState::Failed);
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    policy.base_delay.saturating_mul(factor).min(policy.max_delay)
}

/// Forward transport events until the connection drops, then hand control to
/// the reconnect loop (unless this transport has been superseded).
async fn monitor(
    weak: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    let mut reason = "transport stream ended".to_string();

    loop {
        match events.recv().await {
            Some(TransportEvent::Dropped { reason: r }) => {
                reason = r;
                break;
            }
            Some(event) => {
                let Some(inner) = weak.upgrade() else { return };
                let _ = inner.event_tx.send(event);
            }
            None => break,
        }
    }

    let Some(inner) = weak.upgrade() else { return };
    if inner.generation.load(Ordering::SeqCst) != generation {
        // A newer transport (or a deliberate disconnect) owns the state now.
        return;
    }

    warn!(reason = %reason, "realtime connection dropped");
    inner.commands.lock().unwrap().take();
    inner.state_tx.send_replace(ConnectionState::Disconnected);

    ConnectionManager::from_inner(inner).reconnect_with_backoff().await;
}
