//! WebSocket connection handler (persistent subscription path).
//!
//! Each connection:
//! 1. Waits for a `connect` message with a compatible protocol version
//! 2. Registers a WebSocket session and attaches it to the subscriber hub
//! 3. Serves requests and forwards pushed events until either side closes
//! 4. Detaches and disconnects the session, releasing its locks
//!
//! Replies are written directly by the connection task; events arrive
//! through the session's bounded outbound queue.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dcs_core::{DeviceId, LockSnapshot, SessionId, TransportKind};
use dcs_protocol::{ClientMessage, MessageType, ProtocolVersion, ServerMessage};

use super::hub::{Subscription, OUTBOUND_QUEUE};
use super::AppState;
use crate::registry::{AcquireRequest, CloseReason, RegistryError, SessionTicket};

/// How long a new connection may take to send `connect`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted text frame size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// `GET /api/v1/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| WsConnection::new(socket, state).run())
}

/// What the connection does after handling one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Send this message and keep serving
    Send(ServerMessage),
    /// Close the connection without a reply
    Close,
}

/// Request handling for one connected session, independent of the socket.
#[derive(Clone)]
pub struct SessionDispatcher {
    ticket: SessionTicket,
    state: AppState,
}

impl SessionDispatcher {
    pub fn new(ticket: SessionTicket, state: AppState) -> Self {
        Self { ticket, state }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.ticket.id
    }

    /// Handles one request from the client.
    pub async fn dispatch(&self, msg: ClientMessage) -> Reply {
        let request_id = msg.request_id;
        match self.handle(msg.message, request_id).await {
            Ok(reply) => reply,
            Err(e) => Reply::Send(error_reply(request_id, &e)),
        }
    }

    async fn handle(&self, message: MessageType, request_id: Option<u64>) -> Result<Reply, RegistryError> {
        let registry = &self.state.registry;
        let session_id = self.ticket.id.clone();

        let reply = match message {
            MessageType::Connect { .. } => ServerMessage::error(
                request_id,
                "already_connected",
                "connect is only valid as the first message",
            ),

            MessageType::Acquire {
                device,
                priority,
                mode,
                lease_seconds,
            } => {
                let outcome = registry
                    .acquire(AcquireRequest {
                        device: device.clone(),
                        session_id,
                        priority,
                        mode,
                        lease_seconds,
                        register_if_unknown: false,
                    })
                    .await?;
                match outcome {
                    dcs_core::AcquireOutcome::Granted {
                        lease_expiry,
                        preempted,
                    } => ServerMessage::Granted {
                        request_id,
                        device,
                        lease_expiry,
                        preempted,
                    },
                    dcs_core::AcquireOutcome::Queued { position } => ServerMessage::Queued {
                        request_id,
                        device,
                        position,
                    },
                }
            }

            MessageType::Release { device } => {
                registry.release(device.clone(), session_id).await?;
                ServerMessage::Released { request_id, device }
            }

            MessageType::Renew {
                device,
                lease_seconds,
            } => {
                let lease_expiry = registry
                    .renew(device.clone(), session_id, lease_seconds)
                    .await?;
                ServerMessage::Renewed {
                    request_id,
                    device,
                    lease_expiry,
                }
            }

            MessageType::Cancel { device } => {
                registry.cancel(device.clone(), session_id).await?;
                ServerMessage::Cancelled { request_id, device }
            }

            MessageType::Query { device } => {
                registry.heartbeat(session_id).await?;
                let snapshot = registry.query(device).await?;
                ServerMessage::Snapshot {
                    request_id,
                    snapshot,
                }
            }

            MessageType::Subscribe { devices } => {
                registry.heartbeat(session_id.clone()).await?;
                // Routing starts before the snapshots are taken: a change
                // may be reported twice but never missed
                let hub = &self.state.hub;
                let previous = hub.subscription(&session_id).await.unwrap_or_default();
                hub.set_subscription(&session_id, Subscription::from_request(devices.clone()))
                    .await;
                let snapshots = match self.snapshots(devices.as_deref()).await {
                    Ok(snapshots) => snapshots,
                    Err(e) => {
                        hub.set_subscription(&session_id, previous).await;
                        return Err(e);
                    }
                };
                debug!(session_id = %session_id, devices = ?devices, "Subscribed");
                ServerMessage::Subscribed {
                    request_id,
                    devices,
                    snapshots,
                }
            }

            MessageType::Unsubscribe => {
                registry.heartbeat(session_id.clone()).await?;
                self.state
                    .hub
                    .set_subscription(&session_id, Subscription::None)
                    .await;
                ServerMessage::Unsubscribed { request_id }
            }

            MessageType::Heartbeat => {
                let status = registry.heartbeat(session_id).await?;
                ServerMessage::HeartbeatAck { request_id, status }
            }

            MessageType::Ping { seq } => {
                registry.heartbeat(session_id).await?;
                ServerMessage::pong(seq)
            }

            MessageType::Disconnect => {
                self.state.hub.detach(&self.ticket).await;
                match registry
                    .disconnect_ticket(&self.ticket, CloseReason::Explicit)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_session_unknown() => {}
                    Err(e) => return Err(e),
                }
                return Ok(Reply::Close);
            }
        };

        Ok(Reply::Send(reply))
    }

    async fn snapshots(&self, devices: Option<&[DeviceId]>) -> Result<Vec<LockSnapshot>, RegistryError> {
        let registry = &self.state.registry;
        match devices {
            Some(list) => {
                let mut snapshots = Vec::with_capacity(list.len());
                for device in list {
                    snapshots.push(registry.query(device.clone()).await?);
                }
                Ok(snapshots)
            }
            None => Ok(registry.query_all().await),
        }
    }
}

fn error_reply(request_id: Option<u64>, err: &RegistryError) -> ServerMessage {
    ServerMessage::error(request_id, err.code(), &err.to_string())
}

// ============================================================================
// Connection
// ============================================================================

/// One upgraded WebSocket connection.
pub struct WsConnection {
    socket: WebSocket,
    state: AppState,
}

impl WsConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self { socket, state }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) {
        let ticket = match self.handshake().await {
            Ok(ticket) => ticket,
            Err(e) => {
                debug!(error = %e, "WebSocket handshake failed");
                let _ = self.socket.send(Message::Close(None)).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let closer = CancellationToken::new();
        self.state.hub.attach(&ticket, tx, closer.clone()).await;
        let session_id = ticket.id.clone();

        let connected = ServerMessage::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            session_id: session_id.clone(),
            default_lease_seconds: self.state.config.lease_duration_seconds,
            heartbeat_timeout_seconds: self.state.config.heartbeat_timeout_seconds,
        };

        let dispatcher = SessionDispatcher::new(ticket.clone(), self.state.clone());
        let result = match self.send(&connected).await {
            Ok(()) => self.serve(&dispatcher, rx, &closer).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => debug!(session_id = %session_id, "WebSocket connection closed"),
            Err(e) => debug!(session_id = %session_id, error = %e, "WebSocket connection ended"),
        }

        self.state.hub.detach(&ticket).await;
        match self
            .state
            .registry
            .disconnect_ticket(&ticket, CloseReason::TransportClosed)
            .await
        {
            Ok(summary) => info!(
                session_id = %session_id,
                released = summary.released.len(),
                withdrawn = summary.withdrawn.len(),
                "WebSocket session closed"
            ),
            // Already removed, or the ID now belongs to a newer connection
            Err(e) if e.is_session_unknown() => {}
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to disconnect session"),
        }
    }

    /// Waits for `connect` and registers the session.
    ///
    /// Sends `rejected` on any failure.
    async fn handshake(&mut self) -> Result<SessionTicket, ConnectionError> {
        let first = timeout(HANDSHAKE_TIMEOUT, self.socket.recv())
            .await
            .map_err(|_| ConnectionError::Timeout)?;

        let text = match first {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(_)) => {
                return Err(self.reject(ConnectionError::UnexpectedMessage(
                    "expected a text frame".to_string(),
                )).await)
            }
            Some(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
            None => return Err(ConnectionError::Eof),
        };

        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => return Err(self.reject(ConnectionError::ParseError(e.to_string())).await),
        };

        if ProtocolVersion::negotiate(&msg.protocol_version).is_err() {
            return Err(self
                .reject(ConnectionError::VersionMismatch {
                    client: msg.protocol_version,
                    server: ProtocolVersion::CURRENT,
                })
                .await);
        }

        let MessageType::Connect { client_id } = msg.message else {
            return Err(self
                .reject(ConnectionError::UnexpectedMessage(
                    "first message must be connect".to_string(),
                ))
                .await);
        };

        match self
            .state
            .registry
            .open_session(client_id, TransportKind::WebSocket)
            .await
        {
            Ok(ticket) => Ok(ticket),
            Err(e) => Err(self.reject(ConnectionError::Registry(e)).await),
        }
    }

    /// Sends `rejected` with the error as the reason and returns the error.
    async fn reject(&mut self, err: ConnectionError) -> ConnectionError {
        debug!(error = %err, "Rejecting WebSocket client");
        let _ = self.send(&ServerMessage::rejected(&err.to_string())).await;
        err
    }

    /// Serves requests and forwards events until the connection ends.
    async fn serve(
        &mut self,
        dispatcher: &SessionDispatcher,
        mut outbound: mpsc::Receiver<ServerMessage>,
        closer: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let shutdown = self.state.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = self.socket.send(Message::Close(None)).await;
                    return Ok(());
                }

                _ = closer.cancelled() => {
                    let _ = self.socket.send(Message::Close(None)).await;
                    return Ok(());
                }

                event = outbound.recv() => {
                    match event {
                        Some(event) => self.send(&event).await?,
                        None => return Ok(()),
                    }
                }

                incoming = self.socket.recv() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            self.send(&ServerMessage::error(None, "bad_request", "binary frames are not supported")).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        // Control frames are answered by the WebSocket layer
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
                    };

                    let msg: ClientMessage = match serde_json::from_str(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            self.send(&ServerMessage::error(None, "bad_request", &format!("invalid message: {e}"))).await?;
                            continue;
                        }
                    };

                    match dispatcher.dispatch(msg).await {
                        Reply::Send(reply) => self.send(&reply).await?,
                        Reply::Close => {
                            let _ = self.socket.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn send(&mut self, msg: &ServerMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;
        self.socket
            .send(Message::Text(json))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Handshake timeout")]
    Timeout,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
