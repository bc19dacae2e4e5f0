//! Arbitration decisions.
//!
//! Pure functions over a [`DeviceEntry`]: they decide, the actor applies.
//! Compatibility and preemption are always judged against holders other than
//! the requester, so a holder re-requesting its own device never blocks on
//! itself.

use dcs_core::{LockMode, PendingRequest, Priority, SessionId};

use super::table::DeviceEntry;

/// Outcome of arbitrating one acquire request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Grant now, evicting the listed holders first (usually none).
    Grant { preempt: Vec<SessionId> },
    /// Wait in the device queue.
    Queue,
}

/// Returns true if `mode` can be held alongside every other holder.
fn compatible_with_holders(entry: &DeviceEntry, requester: &SessionId, mode: LockMode) -> bool {
    entry
        .other_holders(requester)
        .all(|lock| lock.mode.is_compatible_with(mode))
}

/// Returns true if an earlier-ranked waiter must be served first.
///
/// A waiter ranks ahead when it is incompatible with the request and has
/// equal or higher priority: equal priority means it arrived first.
fn blocked_by_waiter(
    entry: &DeviceEntry,
    requester: &SessionId,
    priority: Priority,
    mode: LockMode,
) -> bool {
    entry
        .head_excluding(requester)
        .is_some_and(|head| head.priority >= priority && !head.mode.is_compatible_with(mode))
}

/// Decides whether an acquire request is granted, granted by preemption, or
/// queued.
///
/// A current holder whose new request fits alongside the other holders is
/// granted in place, regardless of waiters. Preemption needs an `Exclusive`
/// request whose priority is strictly greater than every other holder's; all
/// of those holders are evicted. Waiters never hold off a preemption.
pub fn decide(
    entry: &DeviceEntry,
    requester: &SessionId,
    priority: Priority,
    mode: LockMode,
) -> Decision {
    if compatible_with_holders(entry, requester, mode) {
        let blocked = blocked_by_waiter(entry, requester, priority, mode);
        return if blocked && !entry.is_held_by(requester) {
            Decision::Queue
        } else {
            Decision::Grant {
                preempt: Vec::new(),
            }
        };
    }
    preempt_or_queue(entry, requester, priority, mode)
}

fn preempt_or_queue(
    entry: &DeviceEntry,
    requester: &SessionId,
    priority: Priority,
    mode: LockMode,
) -> Decision {
    let outranks_all = entry
        .other_holders(requester)
        .all(|lock| priority > lock.priority);

    if mode == LockMode::Exclusive && outranks_all {
        Decision::Grant {
            preempt: entry
                .other_holders(requester)
                .map(|lock| lock.holder.clone())
                .collect(),
        }
    } else {
        Decision::Queue
    }
}

/// Arbitrates the queue head against the current holders.
///
/// Used when draining after a release, expiry, cancel or disconnect. The
/// head is judged by the same rules as a fresh acquire, so it may preempt;
/// the waiters behind it rank lower and are not consulted.
pub fn next_grant(entry: &DeviceEntry) -> Option<(&PendingRequest, Vec<SessionId>)> {
    let head = entry.queue.first()?;
    if compatible_with_holders(entry, &head.session_id, head.mode) {
        return Some((head, Vec::new()));
    }
    match preempt_or_queue(entry, &head.session_id, head.priority, head.mode) {
        Decision::Grant { preempt } => Some((head, preempt)),
        Decision::Queue => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use dcs_core::{DeviceId, Lease, Lock};

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn held(session: &str, priority: i32, mode: LockMode) -> Lock {
        Lock::new(
            DeviceId::new("d1"),
            SessionId::new(session),
            Priority(priority),
            mode,
            Lease::from_secs(10),
            t0(),
        )
    }

    fn waiting(session: &str, priority: i32, mode: LockMode, sequence: u64) -> PendingRequest {
        PendingRequest {
            device: DeviceId::new("d1"),
            session_id: SessionId::new(session),
            priority: Priority(priority),
            mode,
            lease: Lease::from_secs(10),
            enqueued_at: t0(),
            sequence,
        }
    }

    fn entry(holders: Vec<Lock>, queue: Vec<PendingRequest>) -> DeviceEntry {
        DeviceEntry {
            holders,
            queue,
            quarantine: None,
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[test]
    fn test_free_device_grants() {
        let e = entry(vec![], vec![]);
        assert_eq!(
            decide(&e, &sid("s1"), Priority(0), LockMode::Exclusive),
            Decision::Grant { preempt: vec![] }
        );
    }

    #[test]
    fn test_lower_priority_queues() {
        let e = entry(vec![held("s1", 5, LockMode::Exclusive)], vec![]);
        assert_eq!(
            decide(&e, &sid("s2"), Priority(3), LockMode::Exclusive),
            Decision::Queue
        );
    }

    #[test]
    fn test_equal_priority_never_preempts() {
        let e = entry(vec![held("s1", 5, LockMode::Exclusive)], vec![]);
        assert_eq!(
            decide(&e, &sid("s2"), Priority(5), LockMode::Exclusive),
            Decision::Queue
        );
    }

    #[test]
    fn test_higher_priority_exclusive_preempts() {
        let e = entry(vec![held("s1", 5, LockMode::Exclusive)], vec![]);
        assert_eq!(
            decide(&e, &sid("s3"), Priority(9), LockMode::Exclusive),
            Decision::Grant {
                preempt: vec![sid("s1")]
            }
        );
    }

    #[test]
    fn test_higher_priority_shared_does_not_preempt() {
        let e = entry(vec![held("s1", 5, LockMode::Exclusive)], vec![]);
        assert_eq!(
            decide(&e, &sid("s3"), Priority(9), LockMode::SharedRead),
            Decision::Queue
        );
    }

    #[test]
    fn test_shared_joins_shared() {
        let e = entry(
            vec![
                held("r1", 5, LockMode::SharedRead),
                held("r2", 7, LockMode::SharedRead),
            ],
            vec![],
        );
        assert_eq!(
            decide(&e, &sid("r3"), Priority(0), LockMode::SharedRead),
            Decision::Grant { preempt: vec![] }
        );
    }

    #[test]
    fn test_preemption_must_outrank_every_shared_holder() {
        let e = entry(
            vec![
                held("r1", 5, LockMode::SharedRead),
                held("r2", 7, LockMode::SharedRead),
            ],
            vec![],
        );
        assert_eq!(
            decide(&e, &sid("w"), Priority(6), LockMode::Exclusive),
            Decision::Queue
        );
        assert_eq!(
            decide(&e, &sid("w"), Priority(8), LockMode::Exclusive),
            Decision::Grant {
                preempt: vec![sid("r1"), sid("r2")]
            }
        );
    }

    #[test]
    fn test_shared_waits_behind_equal_priority_writer() {
        let e = entry(
            vec![held("r1", 5, LockMode::SharedRead)],
            vec![waiting("w", 5, LockMode::Exclusive, 1)],
        );
        assert_eq!(
            decide(&e, &sid("r2"), Priority(5), LockMode::SharedRead),
            Decision::Queue
        );
        // A higher-priority reader still joins
        assert_eq!(
            decide(&e, &sid("r2"), Priority(6), LockMode::SharedRead),
            Decision::Grant { preempt: vec![] }
        );
    }

    #[test]
    fn test_holder_reacquire_ignores_itself() {
        let e = entry(vec![held("s1", 5, LockMode::SharedRead)], vec![]);
        assert_eq!(
            decide(&e, &sid("s1"), Priority(5), LockMode::Exclusive),
            Decision::Grant { preempt: vec![] }
        );
    }

    #[test]
    fn test_holder_refresh_not_blocked_by_waiter() {
        let e = entry(
            vec![held("s1", 5, LockMode::Exclusive)],
            vec![waiting("s2", 7, LockMode::Exclusive, 1)],
        );
        assert_eq!(
            decide(&e, &sid("s1"), Priority(5), LockMode::Exclusive),
            Decision::Grant { preempt: vec![] }
        );
    }

    #[test]
    fn test_higher_priority_waiter_does_not_hold_off_preemption() {
        let e = entry(
            vec![held("s1", 2, LockMode::Exclusive)],
            vec![waiting("r", 8, LockMode::SharedRead, 1)],
        );
        assert_eq!(
            decide(&e, &sid("s3"), Priority(6), LockMode::Exclusive),
            Decision::Grant {
                preempt: vec![sid("s1")]
            }
        );
    }

    fn next_session(e: &DeviceEntry) -> Option<(&str, Vec<SessionId>)> {
        next_grant(e).map(|(head, preempt)| (head.session_id.as_str(), preempt))
    }

    #[test]
    fn test_next_grant_without_preemption() {
        let shared_held = entry(
            vec![held("r1", 5, LockMode::SharedRead)],
            vec![
                waiting("r2", 3, LockMode::SharedRead, 1),
                waiting("w", 1, LockMode::Exclusive, 2),
            ],
        );
        assert_eq!(next_session(&shared_held), Some(("r2", vec![])));

        let exclusive_held = entry(
            vec![held("s1", 5, LockMode::Exclusive)],
            vec![waiting("s2", 3, LockMode::Exclusive, 1)],
        );
        assert!(next_grant(&exclusive_held).is_none());

        let free = entry(vec![], vec![waiting("s2", 3, LockMode::Exclusive, 1)]);
        assert_eq!(next_session(&free), Some(("s2", vec![])));

        assert!(next_grant(&entry(vec![], vec![])).is_none());
    }

    #[test]
    fn test_next_grant_preempts_lower_shared_holder() {
        let e = entry(
            vec![held("r2", 1, LockMode::SharedRead)],
            vec![waiting("w", 3, LockMode::Exclusive, 1)],
        );
        assert_eq!(next_session(&e), Some(("w", vec![sid("r2")])));
    }

    #[test]
    fn test_next_grant_shared_head_never_preempts() {
        let e = entry(
            vec![held("s1", 1, LockMode::Exclusive)],
            vec![waiting("r", 9, LockMode::SharedRead, 1)],
        );
        assert!(next_grant(&e).is_none());
    }

    #[test]
    fn test_next_grant_equal_priority_head_waits() {
        let e = entry(
            vec![held("s1", 4, LockMode::Exclusive)],
            vec![waiting("s2", 4, LockMode::Exclusive, 1)],
        );
        assert!(next_grant(&e).is_none());
    }
}
