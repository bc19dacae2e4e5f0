//! Request and response bodies for the HTTP request/response path.

use chrono::{DateTime, Utc};
use dcs_core::{
    AcquireOutcome, DeviceDefinition, DeviceId, DomainError, LockMode, Priority, SessionId,
};
use serde::{Deserialize, Serialize};

/// Header carrying the caller's session identity.
pub const SESSION_HEADER: &str = "x-session-id";

/// Body of `POST /sessions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterSessionRequest {
    /// Client-chosen session identifier; the service generates one if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSessionResponse {
    pub session_id: SessionId,
    pub default_lease_seconds: f64,
    pub max_lease_seconds: f64,
    pub heartbeat_timeout_seconds: f64,
}

/// Body of `POST /locks/{device}/acquire`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    #[serde(default)]
    pub priority: Priority,
    pub mode: LockMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub device: DeviceId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub outcome: AcquireOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub device: DeviceId,
    pub released: bool,
}

/// Body of `POST /locks/{device}/renew`. An empty body renews with the
/// default lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenewRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewResponse {
    pub device: DeviceId,
    pub lease_expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub device: DeviceId,
    pub cancelled: bool,
}

/// What a disconnect tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub session_id: SessionId,
    /// Devices whose locks were released
    pub released: Vec<DeviceId>,
    /// Devices whose pending requests were withdrawn
    pub withdrawn: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub count: usize,
    pub devices: Vec<DeviceDefinition>,
}

impl DeviceListResponse {
    pub fn new(devices: Vec<DeviceDefinition>) -> Self {
        Self {
            count: devices.len(),
            devices,
        }
    }
}

/// Result of a catalog reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub device_count: usize,
    pub added: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub protocol_version: String,
    pub started_at: DateTime<Utc>,
    pub device_count: usize,
    pub session_count: usize,
    pub locked_devices: usize,
    pub pending_requests: usize,
    pub quarantined: Vec<DeviceId>,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&DomainError> for ErrorBody {
    fn from(err: &DomainError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_request_defaults() {
        let req: AcquireRequest = serde_json::from_str(r#"{"mode":"exclusive"}"#).unwrap();
        assert_eq!(req.priority, Priority(0));
        assert_eq!(req.mode, LockMode::Exclusive);
        assert!(req.lease_seconds.is_none());
    }

    #[test]
    fn test_acquire_response_flattens_outcome() {
        let resp = AcquireResponse {
            device: DeviceId::new("d1"),
            session_id: SessionId::new("s2"),
            outcome: AcquireOutcome::Queued { position: 1 },
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["position"], 1);
        assert_eq!(json["device"], "d1");
    }

    #[test]
    fn test_error_body_from_domain_error() {
        let err = DomainError::NotHolder {
            device: DeviceId::new("d1"),
            session_id: SessionId::new("s2"),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, "not_holder");
        assert!(body.message.contains("s2"));
    }

    #[test]
    fn test_empty_renew_body() {
        let req: RenewRequest = serde_json::from_str("{}").unwrap();
        assert!(req.lease_seconds.is_none());
    }
}
