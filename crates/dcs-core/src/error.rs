//! Domain-specific error types following panic-free policy.
//!
//! These are the caller-visible failures of the lock API. None of them is
//! fatal to the service; they are reported synchronously to the caller.

use crate::{DeviceId, LockMode, SessionId};
use thiserror::Error;

/// Errors that can occur in lock and session operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Device is not present in the current catalog snapshot.
    #[error("unknown device: {device}")]
    UnknownDevice { device: DeviceId },

    /// Requested lock mode is not supported by the device's capabilities.
    #[error("device {device} does not support {mode} locks (requires {required})")]
    IncompatibleCapability {
        device: DeviceId,
        mode: LockMode,
        required: &'static str,
    },

    /// Release or renew attempted by a session that does not hold the lock.
    #[error("session {session_id} does not hold a lock on {device}")]
    NotHolder {
        device: DeviceId,
        session_id: SessionId,
    },

    /// Cancel attempted by a session with no pending request on the device.
    #[error("session {session_id} has no pending request on {device}")]
    NotQueued {
        device: DeviceId,
        session_id: SessionId,
    },

    /// Operation from a session the service does not know (never registered or expired).
    #[error("unknown session: {session_id}")]
    SessionUnknown { session_id: SessionId },

    /// Requested lease duration is out of range.
    #[error("invalid lease duration {seconds}s (must be > 0 and <= {max_seconds}s)")]
    InvalidLease { seconds: f64, max_seconds: f64 },

    /// The device's pending queue is at capacity.
    #[error("pending queue for {device} is full (max: {max})")]
    QueueFull { device: DeviceId, max: usize },

    /// Device state failed an integrity check and is locked out.
    #[error("device {device} is quarantined: {reason}")]
    DeviceQuarantined { device: DeviceId, reason: String },
}

impl DomainError {
    /// Stable machine-readable code used on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownDevice { .. } => "unknown_device",
            Self::IncompatibleCapability { .. } => "incompatible_capability",
            Self::NotHolder { .. } => "not_holder",
            Self::NotQueued { .. } => "not_queued",
            Self::SessionUnknown { .. } => "session_unknown",
            Self::InvalidLease { .. } => "invalid_lease",
            Self::QueueFull { .. } => "queue_full",
            Self::DeviceQuarantined { .. } => "device_quarantined",
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::UnknownDevice {
            device: DeviceId::new("motor_x"),
        };
        assert_eq!(err.to_string(), "unknown device: motor_x");

        let err = DomainError::NotHolder {
            device: DeviceId::new("det1"),
            session_id: SessionId::new("s1"),
        };
        assert_eq!(err.to_string(), "session s1 does not hold a lock on det1");

        let err = DomainError::IncompatibleCapability {
            device: DeviceId::new("det1"),
            mode: LockMode::Exclusive,
            required: "movable",
        };
        assert!(err.to_string().contains("requires movable"));
    }

    #[test]
    fn test_error_codes_are_distinct() {
        let codes = [
            DomainError::UnknownDevice { device: DeviceId::new("a") }.code(),
            DomainError::SessionUnknown { session_id: SessionId::new("s") }.code(),
            DomainError::QueueFull { device: DeviceId::new("a"), max: 1 }.code(),
            DomainError::InvalidLease { seconds: 0.0, max_seconds: 1.0 }.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
