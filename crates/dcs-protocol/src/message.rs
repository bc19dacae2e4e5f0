//! WebSocket message envelopes.
//!
//! Every frame is one JSON object tagged by `type`. Client requests may carry
//! a `request_id`, which the service echoes on the matching reply so clients
//! can correlate replies with pushed events on the same stream.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use dcs_core::{
    DeviceId, DomainError, LockMode, LockSnapshot, Priority, SessionId, SessionStatusView,
};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; creates the session
    Connect {
        /// Client-chosen session identifier (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<SessionId>,
    },

    /// Request a lock
    Acquire {
        device: DeviceId,
        #[serde(default)]
        priority: Priority,
        mode: LockMode,
        /// Lease in seconds; the service default applies when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_seconds: Option<f64>,
    },

    /// Release a held lock
    Release { device: DeviceId },

    /// Extend a held lock's lease
    Renew {
        device: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_seconds: Option<f64>,
    },

    /// Withdraw a pending request
    Cancel { device: DeviceId },

    /// Read a device's lock state
    Query { device: DeviceId },

    /// Receive pushed events for a set of devices
    Subscribe {
        /// Devices of interest; all devices when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        devices: Option<Vec<DeviceId>>,
    },

    /// Stop receiving device events (own-session events still arrive)
    Unsubscribe,

    /// Liveness signal; returns the session status
    Heartbeat,

    /// Transport-level ping
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Correlation identifier echoed on the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            request_id: None,
            message,
        }
    }

    /// Attaches a correlation identifier.
    #[must_use]
    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn connect(client_id: Option<SessionId>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn acquire(
        device: impl Into<DeviceId>,
        priority: i32,
        mode: LockMode,
        lease_seconds: Option<f64>,
    ) -> Self {
        Self::new(MessageType::Acquire {
            device: device.into(),
            priority: Priority(priority),
            mode,
            lease_seconds,
        })
    }

    pub fn release(device: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::Release {
            device: device.into(),
        })
    }

    pub fn renew(device: impl Into<DeviceId>, lease_seconds: Option<f64>) -> Self {
        Self::new(MessageType::Renew {
            device: device.into(),
            lease_seconds,
        })
    }

    pub fn cancel(device: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::Cancel {
            device: device.into(),
        })
    }

    pub fn query(device: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::Query {
            device: device.into(),
        })
    }

    pub fn subscribe(devices: Option<Vec<DeviceId>>) -> Self {
        Self::new(MessageType::Subscribe { devices })
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from the service to clients: replies and pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        session_id: SessionId,
        default_lease_seconds: f64,
        heartbeat_timeout_seconds: f64,
    },

    /// Handshake rejected (version mismatch, registry full, ...)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Acquire granted
    Granted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        device: DeviceId,
        lease_expiry: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        preempted: Vec<SessionId>,
    },

    /// Acquire queued
    Queued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        device: DeviceId,
        position: usize,
    },

    Released {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        device: DeviceId,
    },

    Renewed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        device: DeviceId,
        lease_expiry: DateTime<Utc>,
    },

    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        device: DeviceId,
    },

    /// Query reply
    Snapshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        snapshot: LockSnapshot,
    },

    Subscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        devices: Option<Vec<DeviceId>>,
        /// Current state of the subscribed devices
        snapshots: Vec<LockSnapshot>,
    },

    Unsubscribed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },

    HeartbeatAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        status: SessionStatusView,
    },

    Pong { seq: u64 },

    /// Error reply
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: String,
        message: String,
    },

    /// Pushed: a device's holder set changed (grant, preemption, release)
    LockChanged {
        device: DeviceId,
        /// Newly granted holder, or a remaining holder, or null when free
        holder: Option<SessionId>,
        mode: Option<LockMode>,
        priority: Option<Priority>,
        lease_expiry: Option<DateTime<Utc>>,
        holder_count: usize,
    },

    /// Pushed: a lease elapsed without renewal
    LockExpired {
        device: DeviceId,
        former_holder: SessionId,
    },

    /// Pushed: a holder was evicted by a higher-priority request
    Preempted {
        device: DeviceId,
        evicted_session: SessionId,
        new_holder: SessionId,
    },
}

impl ServerMessage {
    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn error(request_id: Option<u64>, code: &str, message: &str) -> Self {
        Self::Error {
            request_id,
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Error reply for a domain failure.
    pub fn domain_error(request_id: Option<u64>, err: &DomainError) -> Self {
        Self::error(request_id, err.code(), &err.to_string())
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Returns true for pushed events (as opposed to replies).
    #[must_use]
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Self::LockChanged { .. } | Self::LockExpired { .. } | Self::Preempted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::acquire("motor_x", 5, LockMode::Exclusive, Some(10.0))
            .with_request_id(7);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"acquire\""));
        assert!(json.contains("\"mode\":\"exclusive\""));
        assert!(json.contains("\"request_id\":7"));
        assert!(json.contains("\"priority\":5"));
    }

    #[test]
    fn test_client_message_parses_minimal_acquire() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"acquire","device":"d1","mode":"shared_read"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.request_id, None);
        match msg.message {
            MessageType::Acquire {
                device,
                priority,
                mode,
                lease_seconds,
            } => {
                assert_eq!(device.as_str(), "d1");
                assert_eq!(priority, Priority(0));
                assert_eq!(mode, LockMode::SharedRead);
                assert_eq!(lease_seconds, None);
            }
            other => panic!("Expected Acquire, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_lease_parses_as_seconds() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"renew","device":"d1","lease_seconds":30}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg.message,
            MessageType::Renew { lease_seconds: Some(s), .. } if s == 30.0
        ));
    }

    #[test]
    fn test_server_event_serialization() {
        let msg = ServerMessage::Preempted {
            device: DeviceId::new("d1"),
            evicted_session: SessionId::new("s1"),
            new_holder: SessionId::new("s3"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"preempted\""));
        assert!(json.contains("\"evicted_session\":\"s1\""));
        assert!(msg.is_event());
    }

    #[test]
    fn test_domain_error_reply() {
        let err = DomainError::UnknownDevice {
            device: DeviceId::new("nope"),
        };
        let msg = ServerMessage::domain_error(Some(3), &err);
        match msg {
            ServerMessage::Error {
                request_id,
                code,
                message,
            } => {
                assert_eq!(request_id, Some(3));
                assert_eq!(code, "unknown_device");
                assert!(message.contains("nope"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let original = ClientMessage::subscribe(Some(vec![DeviceId::new("d1"), DeviceId::new("d2")]));
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
