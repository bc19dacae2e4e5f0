//! Registry actor - owns all lock and session state and processes commands.
//!
//! The RegistryActor is the single owner of the lock table and the session
//! table. It receives commands via an mpsc channel, applies them one at a
//! time, and publishes `LockEvent`s via broadcast.
//!
//! Every mutation of a device ends in `settle`: grant whatever the queue
//! allows, verify the entry, then drop it if it became idle. An entry that
//! fails verification is quarantined and never arbitrated again.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Event publish failures (no subscribers) are ignored

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dcs_core::{
    AcquireOutcome, Clock, DeviceId, DomainError, Lease, Lock, LockMode, LockSnapshot,
    PendingRequest, Priority, QueuedView, SessionId, SessionStatusView, TransportKind,
};

use super::arbitration::{self, Decision};
use super::commands::{
    AcquireRequest, CloseReason, DisconnectSummary, LockEvent, RegistryCommand, RegistryError,
    RegistryStatus, SessionTicket,
};
use super::sessions::SessionTable;
use super::table::{DeviceEntry, LockTable, MAX_QUEUE_DEPTH};
use super::RegistryConfig;
use crate::catalog::DeviceDirectory;

fn session_unknown(session_id: &SessionId) -> DomainError {
    DomainError::SessionUnknown {
        session_id: session_id.clone(),
    }
}

/// The registry actor - owns all lock and session state.
///
/// # Ownership
///
/// The actor owns:
/// - `locks`: per-device holders, queue and quarantine flag
/// - `sessions`: session records with their held and queued devices
///
/// It reads the device catalog through a shared [`DeviceDirectory`], taking
/// one snapshot per command.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Event publisher for subscribed connections
    event_publisher: broadcast::Sender<LockEvent>,

    /// Lossless event feeds (the transport's event router)
    feeds: Vec<mpsc::UnboundedSender<LockEvent>>,

    config: RegistryConfig,
    directory: DeviceDirectory,
    clock: Arc<dyn Clock>,

    locks: LockTable,
    sessions: SessionTable,
}

impl RegistryActor {
    /// Creates a new registry actor.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<LockEvent>,
        config: RegistryConfig,
        directory: DeviceDirectory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            receiver,
            event_publisher,
            feeds: Vec::new(),
            config,
            directory,
            clock,
            locks: LockTable::new(),
            sessions: SessionTable::new(),
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            sessions = self.sessions.len(),
            locked_devices = self.locks.locked_count(),
            "Registry actor stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RegisterSession {
                client_id,
                transport,
                respond_to,
            } => {
                let result = self.handle_register_session(client_id, transport);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Heartbeat {
                session_id,
                respond_to,
            } => {
                let result = self.handle_heartbeat(&session_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Disconnect {
                session_id,
                generation,
                reason,
                respond_to,
            } => {
                let now = self.clock.now();
                let result = self.disconnect_session(&session_id, generation, reason, now);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Acquire {
                request,
                respond_to,
            } => {
                let result = self.handle_acquire(*request);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Release {
                device,
                session_id,
                respond_to,
            } => {
                let result = self.handle_release(&device, &session_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Renew {
                device,
                session_id,
                lease_seconds,
                respond_to,
            } => {
                let result = self.handle_renew(&device, &session_id, lease_seconds);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Cancel {
                device,
                session_id,
                respond_to,
            } => {
                let result = self.handle_cancel(&device, &session_id);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Query { device, respond_to } => {
                let _ = respond_to.send(self.handle_query(&device));
            }
            RegistryCommand::QueryAll { respond_to } => {
                let _ = respond_to.send(self.handle_query_all());
            }
            RegistryCommand::Expire { device, respond_to } => {
                let now = self.clock.now();
                let _ = respond_to.send(self.expire_device(&device, now));
            }
            RegistryCommand::Sweep => {
                self.handle_sweep();
            }
            RegistryCommand::Status { respond_to } => {
                let _ = respond_to.send(self.handle_status());
            }
            RegistryCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(self.handle_shutdown());
            }
            RegistryCommand::OpenFeed { respond_to } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.feeds.retain(|feed| !feed.is_closed());
                self.feeds.push(tx);
                let _ = respond_to.send(rx);
            }
        }
    }

    // ========================================================================
    // Session Handlers
    // ========================================================================

    fn handle_register_session(
        &mut self,
        client_id: Option<SessionId>,
        transport: TransportKind,
    ) -> Result<SessionTicket, RegistryError> {
        let session_id = client_id
            .filter(|id| !id.as_str().trim().is_empty())
            .unwrap_or_else(|| SessionId::generated(Uuid::new_v4()));

        let generation = match self
            .sessions
            .register(session_id.clone(), transport, self.clock.now())
        {
            Ok(generation) => generation,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session registration rejected");
                return Err(e);
            }
        };

        info!(
            session_id = %session_id,
            generation,
            transport = %transport,
            total_sessions = self.sessions.len(),
            "Session registered"
        );
        Ok(SessionTicket {
            id: session_id,
            generation,
        })
    }

    fn handle_heartbeat(&mut self, session_id: &SessionId) -> Result<SessionStatusView, RegistryError> {
        self.sessions.touch(session_id, self.clock.now())?;
        debug!(session_id = %session_id, "Heartbeat");
        Ok(self.session_status(session_id)?)
    }

    /// What a session holds and waits for, with queue positions.
    fn session_status(&self, session_id: &SessionId) -> Result<SessionStatusView, DomainError> {
        let record = self
            .sessions
            .get(session_id)
            .ok_or_else(|| session_unknown(session_id))?;

        let queued = record
            .queued
            .iter()
            .filter_map(|device| {
                let position = self.locks.get(device)?.queue_position(session_id)?;
                Some(QueuedView {
                    device: device.clone(),
                    position,
                })
            })
            .collect();

        Ok(SessionStatusView {
            session_id: session_id.clone(),
            transport: record.transport,
            held: record.held.iter().cloned().collect(),
            queued,
            last_heartbeat: record.last_heartbeat,
        })
    }

    /// Withdraws every pending request of a session, releases its locks,
    /// re-arbitrates the affected devices and removes the session.
    ///
    /// A `generation` that does not match the current registration is
    /// treated as an unknown session.
    fn disconnect_session(
        &mut self,
        session_id: &SessionId,
        generation: Option<u64>,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<DisconnectSummary, RegistryError> {
        let current = self.sessions.get(session_id).map(|record| record.generation);
        match (current, generation) {
            (None, _) => return Err(session_unknown(session_id).into()),
            (Some(current), Some(expected)) if current != expected => {
                debug!(session_id = %session_id, current, expected, "Ignoring disconnect of an earlier registration");
                return Err(session_unknown(session_id).into());
            }
            _ => {}
        }
        let record = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| session_unknown(session_id))?;

        let mut withdrawn = Vec::new();
        for device in &record.queued {
            if let Some(entry) = self.locks.get_mut(device) {
                if entry.withdraw(session_id).is_some() {
                    withdrawn.push(device.clone());
                }
            }
        }

        let mut released = Vec::new();
        for device in &record.held {
            let taken = self
                .locks
                .get_mut(device)
                .and_then(|entry| entry.take_holder(session_id));
            if taken.is_some() {
                released.push(device.clone());
                self.publish_holder_change(device);
            }
        }

        let affected: BTreeSet<&DeviceId> = record.queued.iter().chain(&record.held).collect();
        for device in affected {
            self.settle(device, now);
        }

        info!(
            session_id = %session_id,
            reason = %reason,
            released = released.len(),
            withdrawn = withdrawn.len(),
            total_sessions = self.sessions.len(),
            "Session disconnected"
        );

        self.publish(LockEvent::SessionClosed {
            session_id: session_id.clone(),
            generation: record.generation,
            reason,
        });

        Ok(DisconnectSummary {
            session_id: session_id.clone(),
            released,
            withdrawn,
        })
    }

    // ========================================================================
    // Lock Handlers
    // ========================================================================

    fn handle_acquire(&mut self, request: AcquireRequest) -> Result<AcquireOutcome, RegistryError> {
        let AcquireRequest {
            device,
            session_id,
            priority,
            mode,
            lease_seconds,
            register_if_unknown,
        } = request;
        let now = self.clock.now();

        let known = self.sessions.contains(&session_id);
        if !known && !register_if_unknown {
            return Err(session_unknown(&session_id).into());
        }

        let snapshot = self.directory.snapshot();
        let definition = snapshot
            .lookup(&device)
            .ok_or_else(|| DomainError::UnknownDevice {
                device: device.clone(),
            })?;
        if !mode.is_supported_by(&definition.capabilities) {
            return Err(DomainError::IncompatibleCapability {
                device,
                mode,
                required: mode.required_capability(),
            }
            .into());
        }
        self.check_quarantine(&device)?;
        let lease = self.resolve_lease(lease_seconds)?;

        let idle = DeviceEntry::default();
        let decision = arbitration::decide(
            self.locks.get(&device).unwrap_or(&idle),
            &session_id,
            priority,
            mode,
        );
        if decision == Decision::Queue {
            self.check_queue_capacity(&device, &session_id)?;
        }

        if !known {
            self.handle_register_session(Some(session_id.clone()), TransportKind::Http)?;
        }
        self.sessions.touch(&session_id, now)?;

        let outcome = match decision {
            Decision::Grant { preempt } => {
                let lease_expiry =
                    self.grant(&device, &session_id, priority, mode, lease, &preempt, now);
                AcquireOutcome::Granted {
                    lease_expiry,
                    preempted: preempt,
                }
            }
            Decision::Queue => {
                let position = self.enqueue(&device, &session_id, priority, mode, lease, now)?;
                AcquireOutcome::Queued { position }
            }
        };

        self.settle(&device, now);
        Ok(outcome)
    }

    fn handle_release(
        &mut self,
        device: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now();
        self.sessions.touch(session_id, now)?;

        let taken = self
            .locks
            .get_mut(device)
            .and_then(|entry| entry.take_holder(session_id));
        if taken.is_none() {
            return Err(self.not_holder(device, session_id).into());
        }

        self.sessions.mark_released(session_id, device);
        info!(device = %device, session_id = %session_id, "Lock released");

        self.publish_holder_change(device);
        self.settle(device, now);
        Ok(())
    }

    fn handle_renew(
        &mut self,
        device: &DeviceId,
        session_id: &SessionId,
        lease_seconds: Option<f64>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let now = self.clock.now();
        self.sessions.touch(session_id, now)?;
        self.check_quarantine(device)?;
        let lease = self.resolve_lease(lease_seconds)?;

        let not_holder = self.not_holder(device, session_id);
        let lock = self
            .locks
            .get_mut(device)
            .and_then(|entry| entry.holder_mut(session_id))
            .ok_or(not_holder.clone())?;

        if !lock.is_expired(now) {
            lock.renew(lease, now);
            debug!(
                device = %device,
                session_id = %session_id,
                lease_expiry = %lock.lease_expiry,
                renewals = lock.renewal_count,
                "Lease renewed"
            );
            return Ok(lock.lease_expiry);
        }

        // Elapsed but not yet swept: expire now, as the reaper would
        self.expire_device(device, now);
        Err(not_holder.into())
    }

    fn handle_cancel(
        &mut self,
        device: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now();
        self.sessions.touch(session_id, now)?;

        let withdrawn = self
            .locks
            .get_mut(device)
            .and_then(|entry| entry.withdraw(session_id));
        if withdrawn.is_none() {
            if self.is_unknown_device(device) {
                return Err(DomainError::UnknownDevice {
                    device: device.clone(),
                }
                .into());
            }
            return Err(DomainError::NotQueued {
                device: device.clone(),
                session_id: session_id.clone(),
            }
            .into());
        }

        self.sessions.mark_withdrawn(session_id, device);
        debug!(device = %device, session_id = %session_id, "Pending request cancelled");

        self.settle(device, now);
        Ok(())
    }

    fn handle_query(&self, device: &DeviceId) -> Result<LockSnapshot, RegistryError> {
        if self.is_unknown_device(device) {
            return Err(DomainError::UnknownDevice {
                device: device.clone(),
            }
            .into());
        }
        Ok(self.locks.snapshot(device, self.clock.now()))
    }

    fn handle_query_all(&self) -> Vec<LockSnapshot> {
        let now = self.clock.now();
        self.locks
            .iter()
            .map(|(device, entry)| entry.snapshot(device, now))
            .collect()
    }

    // ========================================================================
    // Reaper Handlers
    // ========================================================================

    /// Removes the elapsed leases on one device, then re-arbitrates it.
    ///
    /// Returns the former holders. A device with nothing elapsed (already
    /// released, renewed, or never locked) is left untouched.
    fn expire_device(&mut self, device: &DeviceId, now: DateTime<Utc>) -> Vec<SessionId> {
        let Some(entry) = self.locks.get_mut(device) else {
            return Vec::new();
        };

        let (expired, remaining): (Vec<Lock>, Vec<Lock>) = std::mem::take(&mut entry.holders)
            .into_iter()
            .partition(|lock| lock.is_expired(now));
        entry.holders = remaining;

        if expired.is_empty() {
            return Vec::new();
        }

        let former: Vec<SessionId> = expired.into_iter().map(|lock| lock.holder).collect();
        for holder in &former {
            self.sessions.mark_released(holder, device);
            info!(device = %device, former_holder = %holder, "Lease expired");
            self.publish(LockEvent::Expired {
                device: device.clone(),
                former_holder: holder.clone(),
            });
        }

        self.publish_holder_change(device);
        self.settle(device, now);
        former
    }

    fn handle_sweep(&mut self) {
        let now = self.clock.now();

        let devices = self.locks.devices_with_expired_leases(now);
        for device in &devices {
            self.expire_device(device, now);
        }

        let silent = self.sessions.timed_out(now, self.config.heartbeat_timeout);
        for session_id in &silent {
            warn!(session_id = %session_id, "Session heartbeat timed out");
            if let Err(e) = self.disconnect_session(session_id, None, CloseReason::HeartbeatTimeout, now) {
                warn!(session_id = %session_id, error = %e, "Failed to disconnect timed-out session");
            }
        }

        if !devices.is_empty() || !silent.is_empty() {
            debug!(
                expired_devices = devices.len(),
                timed_out_sessions = silent.len(),
                "Sweep complete"
            );
        }
    }

    fn handle_status(&self) -> RegistryStatus {
        RegistryStatus {
            session_count: self.sessions.len(),
            locked_devices: self.locks.locked_count(),
            pending_requests: self.locks.pending_count(),
            quarantined: self.locks.quarantined(),
        }
    }

    fn handle_shutdown(&mut self) -> usize {
        let now = self.clock.now();
        let ids = self.sessions.ids();
        let mut count = 0;
        for session_id in &ids {
            if self
                .disconnect_session(session_id, None, CloseReason::Shutdown, now)
                .is_ok()
            {
                count += 1;
            }
        }
        info!(sessions = count, "All sessions disconnected for shutdown");
        count
    }

    // ========================================================================
    // Mutation Helpers
    // ========================================================================

    /// Evicts `preempt`, then installs or replaces the requester's lock.
    ///
    /// Returns the new lease expiry.
    #[allow(clippy::too_many_arguments)]
    fn grant(
        &mut self,
        device: &DeviceId,
        session_id: &SessionId,
        priority: Priority,
        mode: LockMode,
        lease: Lease,
        preempt: &[SessionId],
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        for evicted in preempt {
            if let Some(entry) = self.locks.get_mut(device) {
                entry.take_holder(evicted);
            }
            self.sessions.mark_released(evicted, device);
            info!(
                device = %device,
                evicted_session = %evicted,
                new_holder = %session_id,
                priority = %priority,
                "Lock preempted"
            );
            self.publish(LockEvent::Preempted {
                device: device.clone(),
                evicted_session: evicted.clone(),
                new_holder: session_id.clone(),
            });
        }

        let entry = self.locks.entry(device);
        entry.withdraw(session_id);

        let lease_expiry = match entry.holder_mut(session_id) {
            Some(lock) if lock.mode == mode => {
                lock.renew(lease, now);
                lock.priority = priority;
                lock.lease_expiry
            }
            Some(lock) => {
                *lock = Lock::new(device.clone(), session_id.clone(), priority, mode, lease, now);
                lock.lease_expiry
            }
            None => {
                let lock = Lock::new(device.clone(), session_id.clone(), priority, mode, lease, now);
                let lease_expiry = lock.lease_expiry;
                entry.holders.push(lock);
                lease_expiry
            }
        };
        let holder_count = entry.holders.len();

        self.sessions.mark_held(session_id, device);
        info!(
            device = %device,
            session_id = %session_id,
            mode = %mode,
            priority = %priority,
            lease_expiry = %lease_expiry,
            "Lock granted"
        );

        self.publish(LockEvent::Changed {
            device: device.clone(),
            holder: Some(session_id.clone()),
            mode: Some(mode),
            priority: Some(priority),
            lease_expiry: Some(lease_expiry),
            holder_count,
            notify: Some(session_id.clone()),
        });

        lease_expiry
    }

    /// Adds or replaces the requester's pending request.
    fn enqueue(
        &mut self,
        device: &DeviceId,
        session_id: &SessionId,
        priority: Priority,
        mode: LockMode,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> Result<usize, RegistryError> {
        self.check_queue_capacity(device, session_id)?;

        let sequence = self.locks.next_sequence();
        let position = self.locks.entry(device).enqueue(PendingRequest {
            device: device.clone(),
            session_id: session_id.clone(),
            priority,
            mode,
            lease,
            enqueued_at: now,
            sequence,
        });
        self.sessions.mark_queued(session_id, device);

        debug!(
            device = %device,
            session_id = %session_id,
            priority = %priority,
            position,
            "Request queued"
        );
        Ok(position)
    }

    /// Grants queued requests in order for as long as the head wins
    /// arbitration against the remaining holders.
    fn drain(&mut self, device: &DeviceId, now: DateTime<Utc>) {
        loop {
            let next = match self.locks.get(device) {
                Some(entry) if entry.quarantine.is_none() => arbitration::next_grant(entry)
                    .map(|(head, preempt)| (head.clone(), preempt)),
                _ => None,
            };
            let Some((head, preempt)) = next else {
                return;
            };

            self.grant(
                device,
                &head.session_id,
                head.priority,
                head.mode,
                head.lease,
                &preempt,
                now,
            );
        }
    }

    /// Quarantines the entry if it breaks a structural invariant.
    fn verify(&mut self, device: &DeviceId) {
        let sessions = &self.sessions;
        let Some(entry) = self.locks.get_mut(device) else {
            return;
        };
        if entry.quarantine.is_some() {
            return;
        }

        if let Err(reason) = entry.verify(|s| sessions.contains(s)) {
            error!(device = %device, reason = %reason, "Lock state failed verification, quarantining device");
            entry.quarantine = Some(reason);
        }
    }

    /// Post-mutation step for one device: drain, verify, compact.
    fn settle(&mut self, device: &DeviceId, now: DateTime<Utc>) {
        self.drain(device, now);
        self.verify(device);
        self.locks.compact(device);
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    fn check_quarantine(&self, device: &DeviceId) -> Result<(), DomainError> {
        match self.locks.get(device).and_then(|e| e.quarantine.as_ref()) {
            Some(reason) => Err(DomainError::DeviceQuarantined {
                device: device.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Fails with `QueueFull` unless the session already waits on the
    /// device or the queue has room.
    fn check_queue_capacity(&self, device: &DeviceId, session_id: &SessionId) -> Result<(), DomainError> {
        let (already_queued, depth) = self.locks.get(device).map_or((false, 0), |entry| {
            (entry.queued_request(session_id).is_some(), entry.queue.len())
        });
        if !already_queued && depth >= MAX_QUEUE_DEPTH {
            warn!(device = %device, session_id = %session_id, max = MAX_QUEUE_DEPTH, "Device queue full");
            return Err(DomainError::QueueFull {
                device: device.clone(),
                max: MAX_QUEUE_DEPTH,
            });
        }
        Ok(())
    }

    fn resolve_lease(&self, seconds: Option<f64>) -> Result<Lease, DomainError> {
        match seconds {
            Some(seconds) => Lease::from_secs_f64(seconds, self.config.max_lease_seconds),
            None => Ok(self.config.default_lease),
        }
    }

    /// Not in the catalog and not tracked in the lock table.
    fn is_unknown_device(&self, device: &DeviceId) -> bool {
        self.locks.get(device).is_none() && !self.directory.snapshot().contains(device)
    }

    fn not_holder(&self, device: &DeviceId, session_id: &SessionId) -> DomainError {
        if self.is_unknown_device(device) {
            DomainError::UnknownDevice {
                device: device.clone(),
            }
        } else {
            DomainError::NotHolder {
                device: device.clone(),
                session_id: session_id.clone(),
            }
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Publishes `Changed` describing the remaining primary holder, or a
    /// free device.
    fn publish_holder_change(&self, device: &DeviceId) {
        let entry = self.locks.get(device);
        let primary = entry.and_then(|e| e.holders.first());

        self.publish(LockEvent::Changed {
            device: device.clone(),
            holder: primary.map(|l| l.holder.clone()),
            mode: primary.map(|l| l.mode),
            priority: primary.map(|l| l.priority),
            lease_expiry: primary.map(|l| l.lease_expiry),
            holder_count: entry.map_or(0, |e| e.holders.len()),
            notify: None,
        });
    }

    fn publish(&self, event: LockEvent) {
        for feed in &self.feeds {
            // A closed feed is pruned when the next one opens
            let _ = feed.send(event.clone());
        }
        // Ignore if no subscribers
        let _ = self.event_publisher.send(event);
    }
}
