//! HTTP and WebSocket server for the coordination daemon.
//!
//! The server:
//! - Serves the request/response API under `/api/v1`
//! - Upgrades `/api/v1/ws` to persistent subscription sessions
//! - Routes registry events to subscribed sessions through the hub
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  axum::Router   │
//! └───────┬─────────┘
//!         │ /api/v1/...
//!    ┌────┴──────────────┐
//!    ▼                   ▼
//! ┌──────────┐   ┌──────────────┐     ┌─────────────────┐
//! │   http   │   │ WsConnection │────▶│  RegistryHandle │
//! │ handlers │   │ (per client) │     │                 │
//! └──────────┘   └──────▲───────┘     └────────┬────────┘
//!                       │ outbound queue       │ event feed
//!                ┌──────┴───────┐              │
//!                │SubscriberHub │◀─────────────┘
//!                └──────────────┘  event router
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler failures become error responses; the server keeps serving

mod http;
mod hub;
mod websocket;

pub use http::{routes, ApiError};
pub use hub::{event_message, spawn_event_router, Subscription, SubscriberHub, OUTBOUND_QUEUE};
pub use websocket::{ws_handler, ConnectionError, Reply, SessionDispatcher, WsConnection};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::DeviceDirectory;
use crate::config::DaemonConfig;
use crate::registry::{RegistryError, RegistryHandle};

/// Prefix for every route.
pub const API_PREFIX: &str = "/api/v1";

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub directory: DeviceDirectory,
    pub hub: SubscriberHub,
    pub config: Arc<DaemonConfig>,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the daemon shuts down
    pub shutdown: CancellationToken,
}

/// HTTP/WebSocket front end for the registry.
pub struct DaemonServer {
    state: AppState,
}

impl DaemonServer {
    /// Creates a new daemon server.
    ///
    /// # Arguments
    ///
    /// * `registry` - Handle to the lock registry
    /// * `directory` - Device catalog snapshot holder
    /// * `config` - Daemon configuration (listen address, lease defaults)
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        registry: RegistryHandle,
        directory: DeviceDirectory,
        config: DaemonConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            state: AppState {
                registry,
                directory,
                hub: SubscriberHub::new(),
                config: Arc::new(config),
                started_at: Utc::now(),
                shutdown: cancel_token,
            },
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The application router with state attached.
    pub fn router(&self) -> Router {
        Router::new()
            .nest(API_PREFIX, routes())
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.state.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| ServerError::Bind { addr, error })?;
        self.serve(listener).await
    }

    /// Serves on an already-bound listener until the cancellation token
    /// is triggered.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;
        info!(addr = %local_addr, "Daemon server listening");

        let feed = self.state.registry.event_feed().await?;
        let router_task = spawn_event_router(
            feed,
            self.state.registry.clone(),
            self.state.hub.clone(),
            self.state.shutdown.clone(),
        );

        let shutdown = self.state.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.state.shutdown.cancel();
        let closed = self.state.hub.close_all().await;
        let _ = router_task.await;
        info!(open_connections = closed.len(), "Server cleanup complete");

        result.map_err(ServerError::Serve)
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind {
        addr: SocketAddr,
        error: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),

    #[error("Registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}
