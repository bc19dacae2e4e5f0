//! HTTP request/response path.
//!
//! Stateless callers identify themselves with the `x-session-id` header.
//! Bodies are read as raw bytes so an empty body can mean "defaults" and a
//! malformed one maps to the service's own `bad_request` error body.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use dcs_core::{DeviceId, DeviceType, DomainError, LockSnapshot, SessionId, SessionStatusView, TransportKind};
use dcs_protocol::{
    AcquireRequest, AcquireResponse, CancelResponse, DeviceListResponse, DisconnectResponse,
    ErrorBody, ProtocolVersion, RegisterSessionRequest, RegisterSessionResponse, ReleaseResponse,
    ReloadResponse, RenewRequest, RenewResponse, ServiceStatus, SESSION_HEADER,
};

use super::websocket::ws_handler;
use super::AppState;
use crate::catalog::CatalogError;
use crate::registry::{self, CloseReason, RegistryError};

/// Builds the `/api/v1` routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(register_session).delete(disconnect_session))
        .route("/sessions/heartbeat", post(heartbeat))
        .route("/locks", get(list_locks))
        .route("/locks/:device", get(query_lock))
        .route("/locks/:device/acquire", post(acquire))
        .route("/locks/:device/release", post(release))
        .route("/locks/:device/renew", post(renew))
        .route("/locks/:device/cancel", post(cancel))
        .route("/devices", get(list_devices))
        .route("/devices/reload", post(reload_devices))
        .route("/devices/:name", get(get_device))
        .route("/status", get(status))
        .route("/ws", get(ws_handler))
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    BadRequest(String),

    #[error("missing x-session-id header")]
    MissingSession,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Internal(String),
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self::Registry(RegistryError::Domain(err))
    }
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Registry(RegistryError::Domain(e)) => match e {
                DomainError::UnknownDevice { .. } => StatusCode::NOT_FOUND,
                DomainError::IncompatibleCapability { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DomainError::NotHolder { .. } | DomainError::NotQueued { .. } => {
                    StatusCode::CONFLICT
                }
                DomainError::SessionUnknown { .. } => StatusCode::UNAUTHORIZED,
                DomainError::InvalidLease { .. } => StatusCode::BAD_REQUEST,
                DomainError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                DomainError::DeviceQuarantined { .. } => StatusCode::LOCKED,
            },
            Self::Registry(RegistryError::SessionAlreadyExists(_)) => StatusCode::CONFLICT,
            Self::Registry(RegistryError::RegistryFull { .. } | RegistryError::ChannelClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::BadRequest(_) | Self::MissingSession => StatusCode::BAD_REQUEST,
            Self::Catalog(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.code(),
            Self::BadRequest(_) => "bad_request",
            Self::MissingSession => "missing_session",
            Self::Catalog(_) => "catalog_error",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        debug!(status = %status, code = self.code(), error = %self, "Request failed");
        (status, Json(ErrorBody::new(self.code(), self.to_string()))).into_response()
    }
}

// ============================================================================
// Extraction helpers
// ============================================================================

/// Parses an optional JSON body; empty means `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_required(body)
}

fn parse_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

/// The caller's session ID, if the header is present and non-empty.
fn session_header(headers: &HeaderMap) -> Result<Option<SessionId>, ApiError> {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{SESSION_HEADER} must be ASCII")))?
        .trim();
    Ok((!value.is_empty()).then(|| SessionId::new(value)))
}

fn require_session(headers: &HeaderMap) -> Result<SessionId, ApiError> {
    session_header(headers)?.ok_or(ApiError::MissingSession)
}

// ============================================================================
// Sessions
// ============================================================================

async fn register_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<RegisterSessionResponse>), ApiError> {
    let request: RegisterSessionRequest = parse_body(&body)?;
    let session_id = state
        .registry
        .register_session(request.client_id, TransportKind::Http)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterSessionResponse {
            session_id,
            default_lease_seconds: state.config.lease_duration_seconds,
            max_lease_seconds: state.config.max_lease_seconds,
            heartbeat_timeout_seconds: state.config.heartbeat_timeout_seconds,
        }),
    ))
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionStatusView>, ApiError> {
    let session_id = require_session(&headers)?;
    Ok(Json(state.registry.heartbeat(session_id).await?))
}

async fn disconnect_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let session_id = require_session(&headers)?;
    let summary = state
        .registry
        .disconnect(session_id, CloseReason::Explicit)
        .await?;

    Ok(Json(DisconnectResponse {
        session_id: summary.session_id,
        released: summary.released,
        withdrawn: summary.withdrawn,
    }))
}

// ============================================================================
// Locks
// ============================================================================

/// Acquire. Without a session header a new HTTP session is created; an
/// unknown header ID is registered on the spot.
async fn acquire(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcquireResponse>), ApiError> {
    let request: AcquireRequest = parse_required(&body)?;
    let session_id =
        session_header(&headers)?.unwrap_or_else(|| SessionId::generated(Uuid::new_v4()));
    let device = DeviceId::new(device);

    let outcome = state
        .registry
        .acquire(registry::AcquireRequest {
            device: device.clone(),
            session_id: session_id.clone(),
            priority: request.priority,
            mode: request.mode,
            lease_seconds: request.lease_seconds,
            register_if_unknown: true,
        })
        .await?;

    let status = if outcome.is_granted() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(AcquireResponse {
            device,
            session_id,
            outcome,
        }),
    ))
}

async fn release(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let session_id = require_session(&headers)?;
    let device = DeviceId::new(device);
    state.registry.release(device.clone(), session_id).await?;

    Ok(Json(ReleaseResponse {
        device,
        released: true,
    }))
}

async fn renew(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RenewResponse>, ApiError> {
    let session_id = require_session(&headers)?;
    let request: RenewRequest = parse_body(&body)?;
    let device = DeviceId::new(device);
    let lease_expiry = state
        .registry
        .renew(device.clone(), session_id, request.lease_seconds)
        .await?;

    Ok(Json(RenewResponse {
        device,
        lease_expiry,
    }))
}

async fn cancel(
    State(state): State<AppState>,
    Path(device): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, ApiError> {
    let session_id = require_session(&headers)?;
    let device = DeviceId::new(device);
    state.registry.cancel(device.clone(), session_id).await?;

    Ok(Json(CancelResponse {
        device,
        cancelled: true,
    }))
}

async fn query_lock(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Result<Json<LockSnapshot>, ApiError> {
    Ok(Json(state.registry.query(DeviceId::new(device)).await?))
}

async fn list_locks(State(state): State<AppState>) -> Json<Vec<LockSnapshot>> {
    Json(state.registry.query_all().await)
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Deserialize)]
struct DeviceFilter {
    device_type: Option<String>,
}

async fn list_devices(
    State(state): State<AppState>,
    Query(filter): Query<DeviceFilter>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let devices = match filter.device_type.as_deref() {
        Some(label) => {
            let device_type = DeviceType::from_label(label)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown device_type: {label}")))?;
            state.directory.by_type(device_type)
        }
        None => state.directory.snapshot().definitions().cloned().collect(),
    };
    Ok(Json(DeviceListResponse::new(devices)))
}

async fn get_device(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<dcs_core::DeviceDefinition>, ApiError> {
    let device = DeviceId::new(name);
    match state.directory.lookup(&device) {
        Some(definition) => Ok(Json(definition)),
        None => Err(DomainError::UnknownDevice { device }.into()),
    }
}

async fn reload_devices(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let directory = state.directory.clone();
    let summary = tokio::task::spawn_blocking(move || directory.reload())
        .await
        .map_err(reload_task_failed)??;

    Ok(Json(ReloadResponse {
        device_count: summary.device_count,
        added: summary.added,
        removed: summary.removed,
    }))
}

fn reload_task_failed(err: tokio::task::JoinError) -> ApiError {
    ApiError::Internal(format!("reload task failed: {err}"))
}

// ============================================================================
// Status
// ============================================================================

async fn status(State(state): State<AppState>) -> Result<Json<ServiceStatus>, ApiError> {
    let registry_status = state.registry.status().await?;

    Ok(Json(ServiceStatus {
        protocol_version: ProtocolVersion::CURRENT.to_string(),
        started_at: state.started_at,
        device_count: state.directory.snapshot().len(),
        session_count: registry_status.session_count,
        locked_devices: registry_status.locked_devices,
        pending_requests: registry_status.pending_requests,
        quarantined: registry_status.quarantined,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use dcs_core::LockMode;

    #[test]
    fn test_status_code_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                DomainError::UnknownDevice { device: DeviceId::new("d") }.into(),
                StatusCode::NOT_FOUND,
            ),
            (
                DomainError::IncompatibleCapability {
                    device: DeviceId::new("d"),
                    mode: LockMode::Exclusive,
                    required: "movable",
                }
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                DomainError::NotHolder { device: DeviceId::new("d"), session_id: SessionId::new("s") }.into(),
                StatusCode::CONFLICT,
            ),
            (
                DomainError::SessionUnknown { session_id: SessionId::new("s") }.into(),
                StatusCode::UNAUTHORIZED,
            ),
            (
                DomainError::QueueFull { device: DeviceId::new("d"), max: 64 }.into(),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                DomainError::DeviceQuarantined { device: DeviceId::new("d"), reason: "x".into() }.into(),
                StatusCode::LOCKED,
            ),
            (RegistryError::ChannelClosed.into(), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::MissingSession, StatusCode::BAD_REQUEST),
            (ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::MissingSession.code(), "missing_session");
        assert_eq!(ApiError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(
            ApiError::from(RegistryError::RegistryFull { max: 1 }).code(),
            "registry_full"
        );
    }

    #[tokio::test]
    async fn test_crashed_reload_task_is_server_error() {
        let join_err = tokio::task::spawn_blocking(|| panic!("catalog reader crashed"))
            .await
            .unwrap_err();
        let err = reload_task_failed(join_err);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_parse_body_empty_is_default() {
        let request: RenewRequest = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(request.lease_seconds.is_none());

        let err = parse_body::<RenewRequest>(&Bytes::from_static(b"{nope")).unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn test_session_header() {
        let mut headers = HeaderMap::new();
        assert!(session_header(&headers).unwrap().is_none());
        assert!(matches!(require_session(&headers), Err(ApiError::MissingSession)));

        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        assert!(session_header(&headers).unwrap().is_none());

        headers.insert(SESSION_HEADER, HeaderValue::from_static("qs-1"));
        assert_eq!(require_session(&headers).unwrap().as_str(), "qs-1");
    }
}
