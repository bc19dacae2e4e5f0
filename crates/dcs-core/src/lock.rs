//! Lock, lease and pending-request records.
//!
//! These are plain value types. The daemon's lock table owns them and is the
//! only place they are mutated.

use crate::{Capabilities, DeviceId, DomainError, DomainResult, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Priority
// ============================================================================

/// Request priority. Higher values are more privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

// ============================================================================
// Lock Mode
// ============================================================================

/// Access mode of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Sole access; required for motion.
    Exclusive,
    /// Read-only access; any number of holders may share it.
    SharedRead,
}

impl LockMode {
    /// Name of the capability a device needs to accept this mode.
    #[must_use]
    pub fn required_capability(&self) -> &'static str {
        match self {
            Self::Exclusive => "movable",
            Self::SharedRead => "readable",
        }
    }

    /// Returns true if a device with these capabilities accepts this mode.
    #[must_use]
    pub fn is_supported_by(&self, capabilities: &Capabilities) -> bool {
        match self {
            Self::Exclusive => capabilities.movable,
            Self::SharedRead => capabilities.readable,
        }
    }

    /// Returns true if a lock in this mode can coexist with one in `other`.
    #[must_use]
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (Self::SharedRead, Self::SharedRead))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::SharedRead => write!(f, "shared-read"),
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Upper bound on any lease, whatever the configured maximum.
pub const MAX_LEASE_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

/// A validated lease duration, stored in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lease(i64);

impl Lease {
    /// Validates a lease expressed in (possibly fractional) seconds.
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidLease` unless `0 < seconds <= max_seconds`,
    /// `seconds <= MAX_LEASE_SECONDS`, and the value rounds to at least one
    /// millisecond.
    pub fn from_secs_f64(seconds: f64, max_seconds: f64) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidLease {
            seconds,
            max_seconds,
        };

        if !seconds.is_finite() || seconds <= 0.0 || seconds > max_seconds.min(MAX_LEASE_SECONDS) {
            return Err(invalid());
        }

        let millis = (seconds * 1000.0).round() as i64;
        if millis <= 0 {
            return Err(invalid());
        }
        Ok(Self(millis))
    }

    /// Creates a lease from whole seconds without range validation.
    pub const fn from_secs(seconds: u32) -> Self {
        Self(seconds as i64 * 1000)
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.0)
    }

    /// Expiry of this lease when granted at `now`, saturating at the end of
    /// representable time.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.as_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// ============================================================================
// Lock
// ============================================================================

/// An active grant on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub device: DeviceId,
    pub holder: SessionId,
    pub priority: Priority,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    /// Time of the last grant or renewal; `lease_expiry` counts from here
    pub renewed_at: DateTime<Utc>,
    pub lease: Lease,
    pub lease_expiry: DateTime<Utc>,
    pub renewal_count: u32,
}

impl Lock {
    /// Creates a fresh lock granted at `now`.
    pub fn new(
        device: DeviceId,
        holder: SessionId,
        priority: Priority,
        mode: LockMode,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device,
            holder,
            priority,
            mode,
            acquired_at: now,
            renewed_at: now,
            lease,
            lease_expiry: lease.expiry_from(now),
            renewal_count: 0,
        }
    }

    /// Extends the lease from `now`. Priority and mode are unchanged.
    pub fn renew(&mut self, lease: Lease, now: DateTime<Utc>) {
        self.lease = lease;
        self.renewed_at = now;
        self.lease_expiry = lease.expiry_from(now);
        self.renewal_count = self.renewal_count.saturating_add(1);
    }

    /// Returns true once the lease has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expiry
    }

    /// Remaining lease time, clamped at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        let remaining = self.lease_expiry - now;
        if remaining < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            remaining
        }
    }

    /// Returns a serializable view of this lock.
    pub fn view(&self, now: DateTime<Utc>) -> HolderView {
        HolderView {
            session_id: self.holder.clone(),
            mode: self.mode,
            priority: self.priority,
            acquired_at: self.acquired_at,
            lease_expiry: self.lease_expiry,
            remaining_ms: self.remaining(now).num_milliseconds(),
            renewal_count: self.renewal_count,
        }
    }
}

// ============================================================================
// Pending Request
// ============================================================================

/// A request waiting for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub device: DeviceId,
    pub session_id: SessionId,
    pub priority: Priority,
    pub mode: LockMode,
    /// Lease to grant when the request reaches the head of the queue
    pub lease: Lease,
    pub enqueued_at: DateTime<Utc>,
    /// Arrival order; breaks ties between identical timestamps
    pub sequence: u64,
}

impl PendingRequest {
    /// Queue ordering: priority descending, then enqueue time ascending,
    /// then arrival order.
    pub fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

// ============================================================================
// Views
// ============================================================================

/// Serializable view of one holder of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderView {
    pub session_id: SessionId,
    pub mode: LockMode,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
    pub remaining_ms: i64,
    pub renewal_count: u32,
}

/// Read-only snapshot of one device's lock state.
///
/// `holder`, `mode`, `priority` and `remaining_lease_ms` describe the
/// primary holder (the only one for exclusive locks, the earliest for
/// shared locks). All holders are listed in `holders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub device: DeviceId,
    pub holder: Option<SessionId>,
    pub mode: Option<LockMode>,
    pub priority: Option<Priority>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub remaining_lease_ms: Option<i64>,
    pub holders: Vec<HolderView>,
    pub queue_depth: usize,
    pub quarantined: bool,
}

impl LockSnapshot {
    /// Snapshot of a device nobody holds or waits for.
    pub fn unlocked(device: DeviceId) -> Self {
        Self {
            device,
            holder: None,
            mode: None,
            priority: None,
            lease_expiry: None,
            remaining_lease_ms: None,
            holders: Vec::new(),
            queue_depth: 0,
            quarantined: false,
        }
    }

    /// Builds a snapshot from holder views (primary first).
    pub fn from_holders(device: DeviceId, holders: Vec<HolderView>, queue_depth: usize) -> Self {
        let primary = holders.first();
        Self {
            holder: primary.map(|h| h.session_id.clone()),
            mode: primary.map(|h| h.mode),
            priority: primary.map(|h| h.priority),
            lease_expiry: primary.map(|h| h.lease_expiry),
            remaining_lease_ms: primary.map(|h| h.remaining_ms),
            device,
            holders,
            queue_depth,
            quarantined: false,
        }
    }

    /// Returns true if nobody holds the device.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.holders.is_empty()
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of a successful acquire call.
///
/// Being queued is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The lock is held now.
    Granted {
        lease_expiry: DateTime<Utc>,
        /// Sessions evicted to make room (empty unless preemption happened)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        preempted: Vec<SessionId>,
    },
    /// The request waits in the device queue.
    Queued {
        /// 1-based queue position
        position: usize,
    },
}

impl AcquireOutcome {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}
