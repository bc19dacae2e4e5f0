//! Lock registry using the Actor pattern.
//!
//! The registry is the single owner of lock and session state. It combines
//! the lock table, the arbitration engine and the session manager in one
//! task, so every mutation on every device is applied in a total order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ HTTP / WebSocket│────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                   │         ▲                  │
//!         │  RegistryCommand  │         │ Sweep            │ LockEvent
//!         │  (mpsc channel)   │   ┌─────┴──────┐           ▼
//!         ▼                   ▼   │ Lease Reaper│    Subscriber hub
//!   acquire/release      LockTable └────────────┘    (per-session queues)
//!   renew/cancel/...     SessionTable
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use dcs_core::{Clock, Lease};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::catalog::DeviceDirectory;
use crate::config::{ConfigError, DaemonConfig};

mod actor;
mod arbitration;
mod commands;
mod handle;
mod sessions;
mod table;

pub use actor::RegistryActor;
pub use arbitration::{decide, next_grant, Decision};
pub use commands::{
    AcquireRequest, CloseReason, DisconnectSummary, LockEvent, RegistryCommand, RegistryError,
    RegistryStatus, SessionTicket,
};
pub use handle::RegistryHandle;
pub use sessions::{SessionRecord, SessionTable, MAX_SESSIONS};
pub use table::{DeviceEntry, LockTable, MAX_QUEUE_DEPTH};

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
pub const EVENT_BUFFER: usize = 1024;

/// Shortest reaper tick accepted by [`spawn_reaper`].
const MIN_REAPER_TICK: Duration = Duration::from_millis(10);

/// Lease and liveness settings the actor applies.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Lease granted when a request names none
    pub default_lease: Lease,
    /// Longest lease a client may request
    pub max_lease_seconds: f64,
    /// Sessions silent for longer than this are disconnected by the sweep
    pub heartbeat_timeout: chrono::Duration,
}

impl RegistryConfig {
    /// Derives registry settings from the daemon configuration.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if the default lease is out of range.
    pub fn from_daemon(config: &DaemonConfig) -> Result<Self, ConfigError> {
        let default_lease = config
            .default_lease()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            default_lease,
            max_lease_seconds: config.max_lease_seconds,
            heartbeat_timeout: config.heartbeat_timeout(),
        })
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_lease: Lease::from_secs(30),
            max_lease_seconds: 3600.0,
            heartbeat_timeout: chrono::Duration::seconds(60),
        }
    }
}

/// Spawn the registry actor and return a handle for interaction.
///
/// The lease reaper is started separately with [`spawn_reaper`], so tests
/// can drive sweeps themselves against a fake clock.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use dcs_core::{Capabilities, DeviceDefinition, SystemClock};
/// use dcsd::catalog::{DeviceDirectory, StaticCatalog};
/// use dcsd::registry::{spawn_registry, RegistryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let catalog = StaticCatalog::new(vec![DeviceDefinition::from_catalog(
///         "motor_x",
///         "EpicsMotor",
///         "ophyd",
///         Capabilities::new(true, true, false),
///     )]);
///     let directory = DeviceDirectory::load(Arc::new(catalog)).unwrap();
///     let handle = spawn_registry(RegistryConfig::default(), directory, Arc::new(SystemClock));
///
///     let locked = handle.query_all().await;
///     assert!(locked.is_empty());
/// }
/// ```
pub fn spawn_registry(
    config: RegistryConfig,
    directory: DeviceDirectory,
    clock: Arc<dyn Clock>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), config, directory, clock);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}

/// Spawn the lease reaper: a background task that triggers a sweep every
/// `every`.
///
/// A sweep expires every elapsed lease and disconnects sessions whose
/// heartbeat timed out. The task stops once the registry is gone.
pub fn spawn_reaper(handle: RegistryHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(MIN_REAPER_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Fire-and-forget sweep command
            if handle.sweep().await.is_err() {
                debug!("Lease reaper stopping: registry channel closed");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_from_daemon() {
        let daemon = DaemonConfig {
            lease_duration_seconds: 2.5,
            heartbeat_timeout_seconds: 10.0,
            ..DaemonConfig::default()
        };
        let config = RegistryConfig::from_daemon(&daemon).unwrap();
        assert_eq!(config.default_lease.as_millis(), 2500);
        assert_eq!(config.heartbeat_timeout, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_registry_config_rejects_bad_lease() {
        let daemon = DaemonConfig {
            lease_duration_seconds: 7200.0,
            max_lease_seconds: 60.0,
            ..DaemonConfig::default()
        };
        assert!(RegistryConfig::from_daemon(&daemon).is_err());
    }

    #[tokio::test]
    async fn test_reaper_stops_when_registry_gone() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, _) = broadcast::channel(4);
        drop(cmd_rx);

        let reaper = spawn_reaper(RegistryHandle::new(cmd_tx, event_tx), Duration::from_millis(10));
        let finished = tokio::time::timeout(Duration::from_secs(2), reaper).await;
        assert!(finished.is_ok());
    }
}
