//! DCS Protocol - Wire protocol for the coordination service
//!
//! This crate provides the message types exchanged with the daemon:
//! - `message`: tagged JSON envelopes for the WebSocket subscription path
//! - `http`: request/response bodies for the HTTP request/response path
//! - `version`: protocol version negotiation

pub mod http;
pub mod message;
pub mod version;

pub use http::{
    AcquireRequest, AcquireResponse, CancelResponse, DeviceListResponse, DisconnectResponse,
    ErrorBody, RegisterSessionRequest, RegisterSessionResponse, ReleaseResponse, ReloadResponse,
    RenewRequest, RenewResponse, ServiceStatus, SESSION_HEADER,
};
pub use message::{ClientMessage, MessageType, ServerMessage};
pub use version::ProtocolVersion;
