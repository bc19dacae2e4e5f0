//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending
//! commands to the registry actor and subscribing to lock events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use dcs_core::{AcquireOutcome, DeviceId, LockSnapshot, SessionId, SessionStatusView, TransportKind};

use super::commands::{
    AcquireRequest, CloseReason, DisconnectSummary, LockEvent, RegistryCommand, RegistryError,
    RegistryStatus, SessionTicket,
};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// let session = handle.register_session(None, TransportKind::WebSocket).await?;
/// let outcome = handle.acquire(request).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Route event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<LockEvent>,
}

impl RegistryHandle {
    /// Create a new registry handle.
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<LockEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh reply channel and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Create a session. A `session-<uuid>` ID is generated when
    /// `client_id` is `None`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionAlreadyExists` if the chosen ID is taken
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register_session(
        &self,
        client_id: Option<SessionId>,
        transport: TransportKind,
    ) -> Result<SessionId, RegistryError> {
        Ok(self.open_session(client_id, transport).await?.id)
    }

    /// Like [`register_session`](Self::register_session), but also returns
    /// the registration's generation for connection-scoped teardown.
    pub async fn open_session(
        &self,
        client_id: Option<SessionId>,
        transport: TransportKind,
    ) -> Result<SessionTicket, RegistryError> {
        self.request(|respond_to| RegistryCommand::RegisterSession {
            client_id,
            transport,
            respond_to,
        })
        .await?
    }

    /// Refresh a session's liveness and return its status.
    pub async fn heartbeat(&self, session_id: SessionId) -> Result<SessionStatusView, RegistryError> {
        self.request(|respond_to| RegistryCommand::Heartbeat {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Tear a session down, releasing its locks and withdrawing its requests.
    pub async fn disconnect(
        &self,
        session_id: SessionId,
        reason: CloseReason,
    ) -> Result<DisconnectSummary, RegistryError> {
        self.request(|respond_to| RegistryCommand::Disconnect {
            session_id,
            generation: None,
            reason,
            respond_to,
        })
        .await?
    }

    /// Tear down one registration of a session.
    ///
    /// Fails with `SessionUnknown` if the ID has since been registered
    /// again, leaving the newer session untouched.
    pub async fn disconnect_ticket(
        &self,
        ticket: &SessionTicket,
        reason: CloseReason,
    ) -> Result<DisconnectSummary, RegistryError> {
        self.request(|respond_to| RegistryCommand::Disconnect {
            session_id: ticket.id.clone(),
            generation: Some(ticket.generation),
            reason,
            respond_to,
        })
        .await?
    }

    /// Request a lock. Being queued is a successful outcome.
    ///
    /// # Errors
    ///
    /// Domain failures (`UnknownDevice`, `IncompatibleCapability`,
    /// `SessionUnknown`, `InvalidLease`, `QueueFull`, `DeviceQuarantined`)
    /// or `RegistryError::ChannelClosed`.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<AcquireOutcome, RegistryError> {
        self.request(|respond_to| RegistryCommand::Acquire {
            request: Box::new(request),
            respond_to,
        })
        .await?
    }

    pub async fn release(&self, device: DeviceId, session_id: SessionId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Release {
            device,
            session_id,
            respond_to,
        })
        .await?
    }

    /// Extend a held lease; returns the new expiry.
    pub async fn renew(
        &self,
        device: DeviceId,
        session_id: SessionId,
        lease_seconds: Option<f64>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Renew {
            device,
            session_id,
            lease_seconds,
            respond_to,
        })
        .await?
    }

    /// Withdraw a pending request.
    pub async fn cancel(&self, device: DeviceId, session_id: SessionId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Cancel {
            device,
            session_id,
            respond_to,
        })
        .await?
    }

    pub async fn query(&self, device: DeviceId) -> Result<LockSnapshot, RegistryError> {
        self.request(|respond_to| RegistryCommand::Query { device, respond_to })
            .await?
    }

    /// Snapshots of every held or contended device.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn query_all(&self) -> Vec<LockSnapshot> {
        self.request(|respond_to| RegistryCommand::QueryAll { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Expire the elapsed leases on one device; returns the former holders.
    pub async fn expire(&self, device: DeviceId) -> Result<Vec<SessionId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Expire { device, respond_to })
            .await
    }

    /// Trigger a reaper sweep.
    ///
    /// Fire-and-forget: returns once the command is queued. Fails only if
    /// the actor has shut down.
    pub async fn sweep(&self) -> Result<(), RegistryError> {
        self.sender
            .send(RegistryCommand::Sweep)
            .await
            .map_err(|_| RegistryError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<RegistryStatus, RegistryError> {
        self.request(|respond_to| RegistryCommand::Status { respond_to })
            .await
    }

    /// Disconnect every session; returns how many were disconnected.
    pub async fn shutdown(&self) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Shutdown { respond_to })
            .await
    }

    /// Open a lossless, ordered feed of every event published from now on.
    pub async fn event_feed(&self) -> Result<mpsc::UnboundedReceiver<LockEvent>, RegistryError> {
        self.request(|respond_to| RegistryCommand::OpenFeed { respond_to })
            .await
    }

    /// Subscribe to lock events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    /// The broadcast is bounded; a receiver that falls behind sees `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the actor is still running.
    ///
    /// Returns `true` if the command channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::{LockMode, Priority};

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        let handle = RegistryHandle::new(cmd_tx, event_tx);
        (handle, cmd_rx)
    }

    fn create_request(device: &str, session: &str) -> AcquireRequest {
        AcquireRequest {
            device: DeviceId::new(device),
            session_id: SessionId::new(session),
            priority: Priority(5),
            mode: LockMode::Exclusive,
            lease_seconds: Some(2.0),
            register_if_unknown: false,
        }
    }

    #[tokio::test]
    async fn test_handle_is_clone() {
        let (handle, _rx) = create_test_handle();
        let _cloned = handle.clone();
    }

    #[tokio::test]
    async fn test_acquire_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Acquire {
                request,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(request.device.as_str(), "motor_x");
                assert_eq!(request.lease_seconds, Some(2.0));
                let _ = respond_to.send(Ok(AcquireOutcome::Queued { position: 2 }));
                return true;
            }
            false
        });

        let outcome = handle.acquire(create_request("motor_x", "s1")).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Queued { position: 2 });
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.acquire(create_request("motor_x", "s1")).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_channel_closed() {
        let (handle, mut rx) = create_test_handle();

        tokio::spawn(async move {
            // Receive and drop without replying
            let _ = rx.recv().await;
        });

        let result = handle.query(DeviceId::new("motor_x")).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_query_all_returns_empty_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.query_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_passes_reason() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Disconnect {
                session_id,
                generation,
                reason,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(reason, CloseReason::TransportClosed);
                assert_eq!(generation, None);
                let _ = respond_to.send(Ok(DisconnectSummary {
                    session_id,
                    ..DisconnectSummary::default()
                }));
            }
        });

        let summary = handle
            .disconnect(SessionId::new("s1"), CloseReason::TransportClosed)
            .await
            .unwrap();
        assert_eq!(summary.session_id.as_str(), "s1");
        cmd_handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_ticket_passes_generation() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Disconnect {
                generation,
                respond_to,
                ..
            }) = rx.recv().await
            {
                assert_eq!(generation, Some(7));
                let _ = respond_to.send(Ok(DisconnectSummary::default()));
            }
        });

        let ticket = SessionTicket {
            id: SessionId::new("s1"),
            generation: 7,
        };
        handle
            .disconnect_ticket(&ticket, CloseReason::Explicit)
            .await
            .unwrap();
        cmd_handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_fire_and_forget() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler =
            tokio::spawn(async move { matches!(rx.recv().await, Some(RegistryCommand::Sweep)) });

        handle.sweep().await.unwrap();
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_reports_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.sweep().await.is_err());
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());

        drop(rx);
        assert!(!handle.is_connected());
    }
}
