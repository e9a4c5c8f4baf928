//! Production WebSocket transport.
//!
//! Speaks the JSON frame protocol from [`pullse_shared::protocol`] over a
//! tungstenite stream.  The event loop runs in a dedicated tokio task with a
//! select! over the command channel and the socket, mirroring the
//! command/notification pattern used by the rest of the realtime layer.

use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use pullse_shared::protocol::{ClientFrame, PresenceMember, ServerFrame};

use crate::error::RealtimeError;
use crate::transport::{
    Connector, TransportCommand, TransportEvent, TransportHandle, COMMAND_CHANNEL_CAPACITY,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for the managed realtime backend.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the backend's WebSocket endpoint, e.g.
    /// `wss://realtime.pullse.io/v1`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<TransportHandle, RealtimeError>> {
        async move {
            let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
                RealtimeError::ConnectionFailed {
                    attempts: 1,
                    reason: e.to_string(),
                }
            })?;

            let (mut write, mut read) = stream.split();

            // Authenticate, then wait for the backend's acknowledgment.  The
            // caller applies the overall connect timeout.
            let auth = ClientFrame::Auth {
                token: token.to_string(),
            }
            .to_json()
            .map_err(|e| RealtimeError::Protocol(e.to_string()))?;

            write
                .send(WsMessage::Text(auth))
                .await
                .map_err(|e| RealtimeError::ConnectionFailed {
                    attempts: 1,
                    reason: e.to_string(),
                })?;

            loop {
                let message = read.next().await.ok_or(RealtimeError::ConnectionFailed {
                    attempts: 1,
                    reason: "connection closed during handshake".to_string(),
                })?;

                let message = message.map_err(|e| RealtimeError::ConnectionFailed {
                    attempts: 1,
                    reason: e.to_string(),
                })?;

                let WsMessage::Text(text) = message else {
                    continue;
                };

                match ServerFrame::from_json(&text) {
                    Ok(ServerFrame::Connected { connection_id }) => {
                        debug!(connection = %connection_id, "websocket transport connected");
                        break;
                    }
                    Ok(ServerFrame::Error { code, message }) => {
                        return Err(RealtimeError::ConnectionFailed {
                            attempts: 1,
                            reason: format!("{code}: {message}"),
                        });
                    }
                    Ok(other) => {
                        debug!(frame = ?other, "ignoring pre-connected frame");
                    }
                    Err(e) => {
                        return Err(RealtimeError::Protocol(e.to_string()));
                    }
                }
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::unbounded_channel();

            tokio::spawn(run_loop(write, read, cmd_rx, event_tx));

            Ok(TransportHandle {
                commands: cmd_tx,
                events: event_rx,
            })
        }
        .boxed()
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Replies waiting on a backend frame, keyed by request serial.
enum PendingReply {
    Publish(oneshot::Sender<Result<(), RealtimeError>>),
    History(oneshot::Sender<Result<Vec<serde_json::Value>, RealtimeError>>),
    PresenceGet(oneshot::Sender<Result<Vec<PresenceMember>, RealtimeError>>),
}

async fn run_loop(
    mut write: futures::stream::SplitSink<WsStream, WsMessage>,
    mut read: futures::stream::SplitStream<WsStream>,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut next_serial: u64 = 1;
    let mut pending: HashMap<u64, PendingReply> = HashMap::new();
    let reason;

    loop {
        tokio::select! {
            // --- Outgoing commands ---
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    reason = "command channel closed".to_string();
                    break;
                };

                if matches!(cmd, TransportCommand::Close) {
                    let _ = write.send(WsMessage::Close(None)).await;
                    reason = "closed by client".to_string();
                    break;
                }

                let frame = match encode_command(cmd, &mut next_serial, &mut pending) {
                    Some(frame) => frame,
                    None => continue,
                };

                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame");
                        continue;
                    }
                };

                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    reason = format!("write failed: {e}");
                    break;
                }
            }

            // --- Incoming frames ---
            message = read.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        match ServerFrame::from_json(&text) {
                            Ok(frame) => {
                                if let Some(r) = handle_frame(frame, &mut pending, &event_tx) {
                                    reason = r;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding malformed frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        reason = "connection closed by backend".to_string();
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong and binary frames are transport noise.
                    }
                    Some(Err(e)) => {
                        reason = format!("read failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Fail every in-flight request, then announce the drop.
    for (_, waiting) in pending.drain() {
        match waiting {
            PendingReply::Publish(tx) => {
                let _ = tx.send(Err(RealtimeError::TransportClosed));
            }
            PendingReply::History(tx) => {
                let _ = tx.send(Err(RealtimeError::TransportClosed));
            }
            PendingReply::PresenceGet(tx) => {
                let _ = tx.send(Err(RealtimeError::TransportClosed));
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Dropped { reason });
}

/// Turn a command into a wire frame, registering its reply slot if any.
fn encode_command(
    cmd: TransportCommand,
    next_serial: &mut u64,
    pending: &mut HashMap<u64, PendingReply>,
) -> Option<ClientFrame> {
    match cmd {
        TransportCommand::Attach { channel } => Some(ClientFrame::Attach { channel }),
        TransportCommand::Detach { channel } => Some(ClientFrame::Detach { channel }),
        TransportCommand::Publish {
            channel,
            event,
            payload,
            reply,
        } => {
            let id = *next_serial;
            *next_serial += 1;
            pending.insert(id, PendingReply::Publish(reply));
            Some(ClientFrame::Publish {
                id,
                channel,
                event,
                payload,
            })
        }
        TransportCommand::History {
            channel,
            limit,
            before_id,
            reply,
        } => {
            let id = *next_serial;
            *next_serial += 1;
            pending.insert(id, PendingReply::History(reply));
            Some(ClientFrame::History {
                id,
                channel,
                limit,
                before_id,
            })
        }
        TransportCommand::Presence {
            channel,
            action,
            member,
        } => Some(ClientFrame::Presence {
            channel,
            action,
            member,
        }),
        TransportCommand::PresenceGet { channel, reply } => {
            let id = *next_serial;
            *next_serial += 1;
            pending.insert(id, PendingReply::PresenceGet(reply));
            Some(ClientFrame::PresenceGet { id, channel })
        }
        TransportCommand::Close => None,
    }
}

/// Route one backend frame.  Returns `Some(reason)` when the connection must
/// be torn down.
fn handle_frame(
    frame: ServerFrame,
    pending: &mut HashMap<u64, PendingReply>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Option<String> {
    match frame {
        ServerFrame::Ack { id, error } => {
            match pending.remove(&id) {
                Some(PendingReply::Publish(tx)) => {
                    let result = match error {
                        None => Ok(()),
                        Some(e) => Err(RealtimeError::PublishFailed(e)),
                    };
                    let _ = tx.send(result);
                }
                Some(_) | None => {
                    debug!(id, "ack for unknown or mismatched request");
                }
            }
            None
        }
        ServerFrame::History { id, messages } => {
            match pending.remove(&id) {
                Some(PendingReply::History(tx)) => {
                    let _ = tx.send(Ok(messages));
                }
                Some(_) | None => {
                    debug!(id, "history result for unknown request");
                }
            }
            None
        }
        ServerFrame::PresenceState { id, members } => {
            match pending.remove(&id) {
                Some(PendingReply::PresenceGet(tx)) => {
                    let _ = tx.send(Ok(members));
                }
                Some(_) | None => {
                    debug!(id, "presence state for unknown request");
                }
            }
            None
        }
        ServerFrame::Event {
            channel,
            event,
            payload,
        } => {
            let _ = event_tx.send(TransportEvent::Event {
                channel,
                event,
                payload,
            });
            None
        }
        ServerFrame::Presence {
            channel,
            action,
            member,
        } => {
            let _ = event_tx.send(TransportEvent::Presence {
                channel,
                action,
                member,
            });
            None
        }
        ServerFrame::Error { code, message } => {
            Some(format!("backend error {code}: {message}"))
        }
        ServerFrame::Connected { connection_id } => {
            debug!(connection = %connection_id, "duplicate connected frame");
            None
        }
    }
}
