//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `LockEvent`: Events published by the registry for subscribers

use chrono::{DateTime, Utc};
use dcs_core::{
    AcquireOutcome, DeviceId, DomainError, LockMode, LockSnapshot, Priority, SessionId,
    SessionStatusView, TransportKind,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Registry Commands
// ============================================================================

/// A lock request as received from a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireRequest {
    pub device: DeviceId,
    pub session_id: SessionId,
    pub priority: Priority,
    pub mode: LockMode,
    /// Requested lease; the configured default applies when absent
    pub lease_seconds: Option<f64>,
    /// Register `session_id` as an HTTP session if it is unknown
    pub register_if_unknown: bool,
}

/// A registered session.
///
/// `generation` tells this registration apart from earlier ones that used
/// the same client-chosen ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub id: SessionId,
    pub generation: u64,
}

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a session.
    ///
    /// # Errors
    /// - `RegistryError::SessionAlreadyExists` if the chosen ID is taken
    /// - `RegistryError::RegistryFull` if at maximum capacity
    RegisterSession {
        /// Client-chosen ID; a `session-<uuid>` ID is generated when absent
        client_id: Option<SessionId>,
        transport: TransportKind,
        respond_to: oneshot::Sender<Result<SessionTicket, RegistryError>>,
    },

    /// Refresh a session's liveness and report what it holds and waits for.
    Heartbeat {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<SessionStatusView, RegistryError>>,
    },

    /// Tear a session down: withdraw its pending requests, release its locks.
    ///
    /// With a `generation`, only that registration is torn down; a newer
    /// session under the same ID answers `SessionUnknown`.
    Disconnect {
        session_id: SessionId,
        generation: Option<u64>,
        reason: CloseReason,
        respond_to: oneshot::Sender<Result<DisconnectSummary, RegistryError>>,
    },

    /// Request a lock.
    ///
    /// The request is boxed to reduce enum size variance.
    Acquire {
        request: Box<AcquireRequest>,
        respond_to: oneshot::Sender<Result<AcquireOutcome, RegistryError>>,
    },

    Release {
        device: DeviceId,
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Extend a held lease. Replies with the new expiry.
    Renew {
        device: DeviceId,
        session_id: SessionId,
        lease_seconds: Option<f64>,
        respond_to: oneshot::Sender<Result<DateTime<Utc>, RegistryError>>,
    },

    /// Withdraw a pending request.
    Cancel {
        device: DeviceId,
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Read one device's lock state. Never mutates.
    Query {
        device: DeviceId,
        respond_to: oneshot::Sender<Result<LockSnapshot, RegistryError>>,
    },

    /// Read every device that is held or has waiters.
    QueryAll {
        respond_to: oneshot::Sender<Vec<LockSnapshot>>,
    },

    /// Expire the elapsed leases on one device. Replies with the former
    /// holders; empty when nothing had elapsed.
    Expire {
        device: DeviceId,
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// Expire every elapsed lease and time out silent sessions.
    ///
    /// Fire-and-forget, sent by the lease reaper.
    Sweep,

    /// Service-wide counters.
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Disconnect every session. Replies with the number disconnected.
    Shutdown {
        respond_to: oneshot::Sender<usize>,
    },

    /// Open a lossless event feed.
    ///
    /// The feed carries every event published after this command is
    /// processed, in order.
    OpenFeed {
        respond_to: oneshot::Sender<mpsc::UnboundedReceiver<LockEvent>>,
    },
}

/// What a disconnect tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectSummary {
    pub session_id: SessionId,
    pub released: Vec<DeviceId>,
    pub withdrawn: Vec<DeviceId>,
}

/// Service-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatus {
    pub session_count: usize,
    pub locked_devices: usize,
    pub pending_requests: usize,
    pub quarantined: Vec<DeviceId>,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// A caller-visible lock or session failure.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull {
        /// Maximum number of sessions allowed
        max: usize,
    },

    /// A session with this ID already exists.
    #[error("session already exists: {0}")]
    SessionAlreadyExists(SessionId),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

impl RegistryError {
    /// Stable machine-readable code used on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Domain(e) => e.code(),
            Self::RegistryFull { .. } => "registry_full",
            Self::SessionAlreadyExists(_) => "session_exists",
            Self::ChannelClosed => "unavailable",
        }
    }

    /// Returns the domain error, if this is one.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true for `SessionUnknown`.
    #[must_use]
    pub fn is_session_unknown(&self) -> bool {
        matches!(self, Self::Domain(DomainError::SessionUnknown { .. }))
    }
}

// ============================================================================
// Lock Events
// ============================================================================

/// Events published by the registry.
///
/// Device events are routed to subscribers of that device plus one direct
/// recipient; `SessionClosed` tells the transport to drop a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    /// The holder set of a device changed (grant, preemption, release).
    ///
    /// `holder` is the newly granted holder on a grant, otherwise the
    /// remaining primary holder, or `None` when the device is free.
    Changed {
        device: DeviceId,
        holder: Option<SessionId>,
        mode: Option<LockMode>,
        priority: Option<Priority>,
        lease_expiry: Option<DateTime<Utc>>,
        holder_count: usize,
        /// Session that must see this even if not subscribed (the grantee)
        notify: Option<SessionId>,
    },

    /// A lease elapsed without renewal.
    Expired {
        device: DeviceId,
        former_holder: SessionId,
    },

    /// A holder was evicted in favour of a higher-priority request.
    Preempted {
        device: DeviceId,
        evicted_session: SessionId,
        new_holder: SessionId,
    },

    /// A session was removed from the registry.
    SessionClosed {
        session_id: SessionId,
        generation: u64,
        reason: CloseReason,
    },
}

impl LockEvent {
    /// The device this event concerns, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Changed { device, .. }
            | Self::Expired { device, .. }
            | Self::Preempted { device, .. } => Some(device),
            Self::SessionClosed { .. } => None,
        }
    }

    /// The session that receives this event regardless of subscriptions.
    pub fn direct_recipient(&self) -> Option<&SessionId> {
        match self {
            Self::Changed { notify, .. } => notify.as_ref(),
            Self::Expired { former_holder, .. } => Some(former_holder),
            Self::Preempted {
                evicted_session, ..
            } => Some(evicted_session),
            Self::SessionClosed { .. } => None,
        }
    }
}

/// Why a session was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client asked to disconnect.
    Explicit,

    /// The WebSocket connection closed.
    TransportClosed,

    /// No heartbeat within the configured timeout.
    HeartbeatTimeout,

    /// The client fell behind its outbound event queue.
    Overflow,

    /// The service is shutting down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit disconnect"),
            Self::TransportClosed => write!(f, "connection closed"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Overflow => write!(f, "outbound queue overflow"),
            Self::Shutdown => write!(f, "service shutdown"),
        }
    }
}
