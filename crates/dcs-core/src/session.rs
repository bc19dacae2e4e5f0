//! Client session identity and status views.

use crate::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix used for server-generated session IDs.
pub const GENERATED_SESSION_PREFIX: &str = "session-";

/// Identifier of one connected client (queue server, external control service, ...).
///
/// Either chosen by the client at connect time or generated by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a server-generated session ID from a unique token.
    pub fn generated(token: impl fmt::Display) -> Self {
        Self(format!("{GENERATED_SESSION_PREFIX}{token}"))
    }

    /// Returns true if this ID was generated by the service.
    #[must_use]
    pub fn is_generated(&self) -> bool {
        self.0.starts_with(GENERATED_SESSION_PREFIX)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a session talks to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Stateless request/response caller; learns about grants by polling.
    #[default]
    Http,
    /// Persistent subscription connection receiving pushed events.
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// A pending request as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedView {
    pub device: DeviceId,
    /// 1-based position in the device queue
    pub position: usize,
}

/// Session status returned by heartbeat.
///
/// HTTP-only callers poll this to discover that a queued request was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub transport: TransportKind,
    /// Devices currently held, in name order
    pub held: Vec<DeviceId>,
    /// Devices the session is queued for, in name order
    pub queued: Vec<QueuedView>,
    pub last_heartbeat: DateTime<Utc>,
}
