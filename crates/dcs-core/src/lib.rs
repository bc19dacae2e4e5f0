//! DCS Core - Shared types for device coordination
//!
//! This crate provides the domain types shared between the coordination
//! daemon (dcsd), its wire protocol, and client tooling: device identity and
//! capabilities, lock and queue records, session identity, and the clock
//! abstraction used for lease arithmetic.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod clock;
pub mod device;
pub mod error;
pub mod lock;
pub mod session;

// Re-exports for convenience
pub use clock::{Clock, FakeClock, SystemClock};
pub use device::{Capabilities, DeviceDefinition, DeviceId, DeviceType};
pub use error::{DomainError, DomainResult};
pub use lock::{
    AcquireOutcome, HolderView, Lease, Lock, LockMode, LockSnapshot, PendingRequest, Priority,
    MAX_LEASE_SECONDS,
};
pub use session::{QueuedView, SessionId, SessionStatusView, TransportKind};
