//! Lock table: per-device holders, pending queue and quarantine flag.
//!
//! Only the registry actor mutates it. Holders are kept in grant order (the
//! first is the primary holder reported in snapshots); the queue is kept
//! sorted by [`PendingRequest::queue_order`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dcs_core::{DeviceId, Lock, LockMode, LockSnapshot, PendingRequest, SessionId};

/// Maximum pending requests per device.
pub const MAX_QUEUE_DEPTH: usize = 64;

/// Lock state of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceEntry {
    pub holders: Vec<Lock>,
    pub queue: Vec<PendingRequest>,
    /// Set once the entry fails verification; never cleared
    pub quarantine: Option<String>,
}

impl DeviceEntry {
    /// Returns true if nothing holds, waits for, or quarantines the device.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty() && self.quarantine.is_none()
    }

    pub fn holder(&self, session_id: &SessionId) -> Option<&Lock> {
        self.holders.iter().find(|l| &l.holder == session_id)
    }

    pub fn holder_mut(&mut self, session_id: &SessionId) -> Option<&mut Lock> {
        self.holders.iter_mut().find(|l| &l.holder == session_id)
    }

    pub fn is_held_by(&self, session_id: &SessionId) -> bool {
        self.holder(session_id).is_some()
    }

    /// Removes and returns `session_id`'s lock.
    pub fn take_holder(&mut self, session_id: &SessionId) -> Option<Lock> {
        let index = self.holders.iter().position(|l| &l.holder == session_id)?;
        Some(self.holders.remove(index))
    }

    /// Holders other than `session_id`.
    pub fn other_holders<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> impl Iterator<Item = &'a Lock> + 'a {
        self.holders.iter().filter(move |l| &l.holder != session_id)
    }

    /// 1-based queue position of `session_id`'s request.
    pub fn queue_position(&self, session_id: &SessionId) -> Option<usize> {
        self.queue
            .iter()
            .position(|r| &r.session_id == session_id)
            .map(|i| i + 1)
    }

    pub fn queued_request(&self, session_id: &SessionId) -> Option<&PendingRequest> {
        self.queue.iter().find(|r| &r.session_id == session_id)
    }

    /// First queued request that does not belong to `session_id`.
    pub fn head_excluding(&self, session_id: &SessionId) -> Option<&PendingRequest> {
        self.queue.iter().find(|r| &r.session_id != session_id)
    }

    /// Inserts or replaces `request` and returns its 1-based position.
    ///
    /// A replacement keeps the original enqueue time and arrival sequence.
    pub fn enqueue(&mut self, mut request: PendingRequest) -> usize {
        if let Some(index) = self
            .queue
            .iter()
            .position(|r| r.session_id == request.session_id)
        {
            let previous = self.queue.remove(index);
            request.enqueued_at = previous.enqueued_at;
            request.sequence = previous.sequence;
        }

        let index = self
            .queue
            .iter()
            .position(|r| request.queue_order(r) == Ordering::Less)
            .unwrap_or(self.queue.len());
        self.queue.insert(index, request);
        index + 1
    }

    /// Removes and returns `session_id`'s pending request.
    pub fn withdraw(&mut self, session_id: &SessionId) -> Option<PendingRequest> {
        let index = self.queue.iter().position(|r| &r.session_id == session_id)?;
        Some(self.queue.remove(index))
    }

    /// Read-only snapshot. Takes `now` for remaining-lease figures only.
    pub fn snapshot(&self, device: &DeviceId, now: DateTime<Utc>) -> LockSnapshot {
        let views = self.holders.iter().map(|l| l.view(now)).collect();
        let mut snapshot = LockSnapshot::from_holders(device.clone(), views, self.queue.len());
        snapshot.quarantined = self.quarantine.is_some();
        snapshot
    }

    /// Checks the entry's structural invariants.
    ///
    /// `session_exists` resolves session IDs against the session table.
    /// Returns a description of the first violation found.
    pub fn verify<F>(&self, session_exists: F) -> Result<(), String>
    where
        F: Fn(&SessionId) -> bool,
    {
        let exclusive = self
            .holders
            .iter()
            .filter(|l| l.mode == LockMode::Exclusive)
            .count();
        if exclusive > 1 || (exclusive == 1 && self.holders.len() > 1) {
            return Err(format!(
                "mixed or multiple exclusive holders ({} holders, {} exclusive)",
                self.holders.len(),
                exclusive
            ));
        }

        for (i, lock) in self.holders.iter().enumerate() {
            if self.holders.iter().take(i).any(|l| l.holder == lock.holder) {
                return Err(format!("session {} holds the device twice", lock.holder));
            }
            let span = lock.lease_expiry - lock.renewed_at;
            if span != lock.lease.as_duration() || span <= chrono::Duration::zero() {
                return Err(format!(
                    "lease of {} does not match its duration ({}ms vs {}ms)",
                    lock.holder,
                    span.num_milliseconds(),
                    lock.lease.as_millis()
                ));
            }
            if !session_exists(&lock.holder) {
                return Err(format!("holder {} has no session", lock.holder));
            }
        }

        for pair in self.queue.windows(2) {
            if let [a, b] = pair {
                if a.queue_order(b) != Ordering::Less {
                    return Err(format!(
                        "queue out of order ({} before {})",
                        a.session_id, b.session_id
                    ));
                }
            }
        }
        for (i, request) in self.queue.iter().enumerate() {
            if self
                .queue
                .iter()
                .take(i)
                .any(|r| r.session_id == request.session_id)
            {
                return Err(format!("session {} queued twice", request.session_id));
            }
            if !session_exists(&request.session_id) {
                return Err(format!("waiter {} has no session", request.session_id));
            }
        }

        Ok(())
    }
}

/// Device name → lock state. Idle devices have no entry.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: BTreeMap<DeviceId, DeviceEntry>,
    next_sequence: u64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &DeviceId) -> Option<&DeviceEntry> {
        self.entries.get(device)
    }

    pub fn get_mut(&mut self, device: &DeviceId) -> Option<&mut DeviceEntry> {
        self.entries.get_mut(device)
    }

    pub fn entry(&mut self, device: &DeviceId) -> &mut DeviceEntry {
        self.entries.entry(device.clone()).or_default()
    }

    /// Drops the entry if it became idle.
    pub fn compact(&mut self, device: &DeviceId) {
        if self.entries.get(device).is_some_and(DeviceEntry::is_idle) {
            self.entries.remove(device);
        }
    }

    /// Next arrival sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &DeviceEntry)> {
        self.entries.iter()
    }

    /// Snapshot of one device; unlocked when there is no entry.
    pub fn snapshot(&self, device: &DeviceId, now: DateTime<Utc>) -> LockSnapshot {
        match self.entries.get(device) {
            Some(entry) => entry.snapshot(device, now),
            None => LockSnapshot::unlocked(device.clone()),
        }
    }

    /// Devices with at least one lease elapsed at `now`.
    pub fn devices_with_expired_leases(&self, now: DateTime<Utc>) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.holders.iter().any(|l| l.is_expired(now)))
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn quarantined(&self) -> Vec<DeviceId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.quarantine.is_some())
            .map(|(d, _)| d.clone())
            .collect()
    }

    pub fn locked_count(&self) -> usize {
        self.entries.values().filter(|e| !e.holders.is_empty()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().map(|e| e.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::{Lease, Priority};

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn request(session: &str, priority: i32, offset_secs: i64, sequence: u64) -> PendingRequest {
        PendingRequest {
            device: DeviceId::new("d1"),
            session_id: SessionId::new(session),
            priority: Priority(priority),
            mode: LockMode::Exclusive,
            lease: Lease::from_secs(10),
            enqueued_at: t0() + chrono::Duration::seconds(offset_secs),
            sequence,
        }
    }

    fn lock(session: &str, mode: LockMode) -> Lock {
        Lock::new(
            DeviceId::new("d1"),
            SessionId::new(session),
            Priority(1),
            mode,
            Lease::from_secs(10),
            t0(),
        )
    }

    fn queue_sessions(entry: &DeviceEntry) -> Vec<&str> {
        entry.queue.iter().map(|r| r.session_id.as_str()).collect()
    }

    #[test]
    fn test_enqueue_orders_by_priority_then_time() {
        let mut entry = DeviceEntry::default();
        assert_eq!(entry.enqueue(request("low", 1, 0, 1)), 1);
        assert_eq!(entry.enqueue(request("high", 9, 1, 2)), 1);
        assert_eq!(entry.enqueue(request("mid-early", 5, 2, 3)), 2);
        assert_eq!(entry.enqueue(request("mid-late", 5, 3, 4)), 3);

        assert_eq!(
            queue_sessions(&entry),
            vec!["high", "mid-early", "mid-late", "low"]
        );
        assert!(entry.verify(|_| true).is_ok());
    }

    #[test]
    fn test_requeue_keeps_original_timestamp() {
        let mut entry = DeviceEntry::default();
        entry.enqueue(request("a", 5, 0, 1));
        entry.enqueue(request("b", 5, 1, 2));

        // "a" re-requests later; it keeps its place among equal priorities
        let position = entry.enqueue(request("a", 5, 10, 3));
        assert_eq!(position, 1);
        assert_eq!(entry.queue.len(), 2);
        assert_eq!(entry.queued_request(&SessionId::new("a")).unwrap().sequence, 1);
    }

    #[test]
    fn test_withdraw() {
        let mut entry = DeviceEntry::default();
        entry.enqueue(request("a", 5, 0, 1));
        assert!(entry.withdraw(&SessionId::new("b")).is_none());
        assert!(entry.withdraw(&SessionId::new("a")).is_some());
        assert!(entry.is_idle());
    }

    #[test]
    fn test_verify_detects_mixed_modes() {
        let entry = DeviceEntry {
            holders: vec![lock("a", LockMode::Exclusive), lock("b", LockMode::SharedRead)],
            ..DeviceEntry::default()
        };
        assert!(entry.verify(|_| true).unwrap_err().contains("exclusive"));
    }

    #[test]
    fn test_verify_allows_many_shared() {
        let entry = DeviceEntry {
            holders: vec![
                lock("a", LockMode::SharedRead),
                lock("b", LockMode::SharedRead),
                lock("c", LockMode::SharedRead),
            ],
            ..DeviceEntry::default()
        };
        assert!(entry.verify(|_| true).is_ok());
    }

    #[test]
    fn test_verify_detects_missing_session() {
        let entry = DeviceEntry {
            holders: vec![lock("ghost", LockMode::Exclusive)],
            ..DeviceEntry::default()
        };
        let err = entry.verify(|s| s.as_str() != "ghost").unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn test_verify_detects_unsorted_queue() {
        let entry = DeviceEntry {
            queue: vec![request("low", 1, 0, 1), request("high", 9, 1, 2)],
            ..DeviceEntry::default()
        };
        assert!(entry.verify(|_| true).unwrap_err().contains("out of order"));
    }

    #[test]
    fn test_verify_detects_bad_lease() {
        let mut bad = lock("a", LockMode::Exclusive);
        bad.lease_expiry = bad.renewed_at;
        let entry = DeviceEntry {
            holders: vec![bad],
            ..DeviceEntry::default()
        };
        assert!(entry.verify(|_| true).is_err());
    }

    #[test]
    fn test_table_compact_and_counts() {
        let mut table = LockTable::new();
        let device = DeviceId::new("d1");
        table.entry(&device).holders.push(lock("a", LockMode::Exclusive));
        table.entry(&device).enqueue(request("b", 1, 0, 1));

        assert_eq!(table.locked_count(), 1);
        assert_eq!(table.pending_count(), 1);

        table.compact(&device);
        assert!(table.get(&device).is_some());

        let entry = table.entry(&device);
        entry.holders.clear();
        entry.queue.clear();
        table.compact(&device);
        assert!(table.get(&device).is_none());
    }

    #[test]
    fn test_expired_lease_scan() {
        let mut table = LockTable::new();
        table
            .entry(&DeviceId::new("d1"))
            .holders
            .push(lock("a", LockMode::Exclusive));

        assert!(table.devices_with_expired_leases(t0()).is_empty());
        let later = t0() + chrono::Duration::seconds(10);
        assert_eq!(
            table.devices_with_expired_leases(later),
            vec![DeviceId::new("d1")]
        );
    }
}
