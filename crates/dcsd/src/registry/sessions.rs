//! Session table.
//!
//! Owns the authoritative session records. The lock table refers to
//! sessions by ID only; tearing a session down is driven from here into the
//! lock table, never the reverse.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dcs_core::{DeviceId, DomainError, SessionId, TransportKind};

use super::commands::RegistryError;

/// Maximum number of concurrent sessions.
pub const MAX_SESSIONS: usize = 256;

/// Server-side record of one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Distinguishes this registration from earlier ones under the same ID
    pub generation: u64,
    pub transport: TransportKind,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Devices this session currently holds
    pub held: BTreeSet<DeviceId>,
    /// Devices this session is queued for
    pub queued: BTreeSet<DeviceId>,
}

impl SessionRecord {
    fn new(id: SessionId, generation: u64, transport: TransportKind, now: DateTime<Utc>) -> Self {
        Self {
            id,
            generation,
            transport,
            created_at: now,
            last_heartbeat: now,
            held: BTreeSet::new(),
            queued: BTreeSet::new(),
        }
    }

    /// Returns true if the last heartbeat is older than `timeout`.
    #[must_use]
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, SessionRecord>,
    next_generation: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session and returns the generation assigned to it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionAlreadyExists` if the ID is taken
    /// - `RegistryError::RegistryFull` at `MAX_SESSIONS`
    pub fn register(
        &mut self,
        id: SessionId,
        transport: TransportKind,
        now: DateTime<Utc>,
    ) -> Result<u64, RegistryError> {
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::SessionAlreadyExists(id));
        }
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(RegistryError::RegistryFull { max: MAX_SESSIONS });
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.sessions
            .insert(id.clone(), SessionRecord::new(id, generation, transport, now));
        Ok(generation)
    }

    /// Refreshes a session's heartbeat.
    pub fn touch(&mut self, id: &SessionId, now: DateTime<Utc>) -> Result<(), DomainError> {
        match self.sessions.get_mut(id) {
            Some(record) => {
                record.last_heartbeat = now;
                Ok(())
            }
            None => Err(DomainError::SessionUnknown {
                session_id: id.clone(),
            }),
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut SessionRecord> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    /// Records that `id` now holds `device` and no longer waits for it.
    pub fn mark_held(&mut self, id: &SessionId, device: &DeviceId) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.queued.remove(device);
            record.held.insert(device.clone());
        }
    }

    pub fn mark_released(&mut self, id: &SessionId, device: &DeviceId) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.held.remove(device);
        }
    }

    pub fn mark_queued(&mut self, id: &SessionId, device: &DeviceId) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.queued.insert(device.clone());
        }
    }

    pub fn mark_withdrawn(&mut self, id: &SessionId, device: &DeviceId) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.queued.remove(device);
        }
    }

    /// Sessions whose heartbeat is older than `timeout`, in ID order.
    pub fn timed_out(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_timed_out(now, timeout))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All session IDs, in ID order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
