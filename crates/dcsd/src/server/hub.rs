//! Subscriber hub: fan-out of lock events to WebSocket sessions.
//!
//! Each attached session owns a bounded outbound queue. The event router
//! pushes with `try_send`, so a slow client never blocks arbitration; a
//! client whose queue is full is closed instead of losing events.
//!
//! The router reads the registry's lossless event feed, so a burst of
//! events never costs an unrelated session its connection. Entries carry
//! the session generation: a close aimed at an earlier registration never
//! reaches a connection that reused the same ID.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dcs_core::{DeviceId, SessionId};
use dcs_protocol::ServerMessage;

use crate::registry::{CloseReason, LockEvent, RegistryHandle, SessionTicket};

/// Capacity of each session's outbound event queue.
pub const OUTBOUND_QUEUE: usize = 256;

/// Which device events a session receives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Subscription {
    /// Only events addressed to the session itself
    #[default]
    None,
    /// Every device
    All,
    /// The listed devices
    Devices(BTreeSet<DeviceId>),
}

impl Subscription {
    /// Builds a subscription from a `subscribe` request; no list means all.
    pub fn from_request(devices: Option<Vec<DeviceId>>) -> Self {
        match devices {
            Some(devices) => Self::Devices(devices.into_iter().collect()),
            None => Self::All,
        }
    }

    #[must_use]
    pub fn covers(&self, device: &DeviceId) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Devices(devices) => devices.contains(device),
        }
    }
}

/// An attached WebSocket session.
#[derive(Debug)]
pub struct Subscriber {
    generation: u64,
    sender: mpsc::Sender<ServerMessage>,
    subscription: Subscription,
    /// Cancelled to make the connection close itself
    closer: CancellationToken,
}

/// Attached sessions keyed by session ID. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SubscriberHub {
    subscribers: Arc<RwLock<HashMap<SessionId, Subscriber>>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a session with no device subscription.
    ///
    /// A connection still attached under an earlier generation of the same
    /// ID belongs to a session that no longer exists; it is told to close.
    pub async fn attach(
        &self,
        ticket: &SessionTicket,
        sender: mpsc::Sender<ServerMessage>,
        closer: CancellationToken,
    ) {
        let mut subs = self.subscribers.write().await;
        let replaced = subs.insert(
            ticket.id.clone(),
            Subscriber {
                generation: ticket.generation,
                sender,
                subscription: Subscription::None,
                closer,
            },
        );
        if let Some(stale) = replaced {
            debug!(session_id = %ticket.id, generation = stale.generation, "Closing connection of an earlier registration");
            stale.closer.cancel();
        }
        debug!(session_id = %ticket.id, generation = ticket.generation, total = subs.len(), "Subscriber attached");
    }

    /// Removes a session's connection if it is still the attached one.
    /// Returns false otherwise.
    pub async fn detach(&self, ticket: &SessionTicket) -> bool {
        let removed = take_attached(&mut *self.subscribers.write().await, ticket).is_some();
        if removed {
            debug!(session_id = %ticket.id, "Subscriber detached");
        }
        removed
    }

    pub async fn set_subscription(&self, session_id: &SessionId, subscription: Subscription) -> bool {
        match self.subscribers.write().await.get_mut(session_id) {
            Some(sub) => {
                sub.subscription = subscription;
                true
            }
            None => false,
        }
    }

    pub async fn subscription(&self, session_id: &SessionId) -> Option<Subscription> {
        self.subscribers
            .read()
            .await
            .get(session_id)
            .map(|sub| sub.subscription.clone())
    }

    /// Detaches a session and tells its connection to close, provided the
    /// attached connection belongs to `generation`.
    pub async fn close(&self, session_id: &SessionId, generation: u64) -> bool {
        let ticket = SessionTicket {
            id: session_id.clone(),
            generation,
        };
        match take_attached(&mut *self.subscribers.write().await, &ticket) {
            Some(sub) => {
                sub.closer.cancel();
                true
            }
            None => false,
        }
    }

    /// Detaches and closes every session. Returns their IDs.
    pub async fn close_all(&self) -> Vec<SessionId> {
        let mut subs = self.subscribers.write().await;
        let mut ids = Vec::with_capacity(subs.len());
        for (id, sub) in subs.drain() {
            sub.closer.cancel();
            ids.push(id);
        }
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Routes one event to every interested session.
    ///
    /// Returns the sessions that overflowed their queue; they have been
    /// detached and told to close.
    pub async fn dispatch(&self, event: &LockEvent) -> Vec<SessionTicket> {
        if let LockEvent::SessionClosed {
            session_id,
            generation,
            reason,
        } = event
        {
            if self.close(session_id, *generation).await {
                debug!(session_id = %session_id, reason = %reason, "Closed connection of removed session");
            }
            return Vec::new();
        }

        let (Some(device), Some(message)) = (event.device(), event_message(event)) else {
            return Vec::new();
        };
        let recipient = event.direct_recipient();

        let mut overflowed = Vec::new();
        let mut gone = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for (id, sub) in subs.iter() {
                if !sub.subscription.covers(device) && recipient != Some(id) {
                    continue;
                }
                let ticket = SessionTicket {
                    id: id.clone(),
                    generation: sub.generation,
                };
                match sub.sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(ticket),
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(ticket),
                }
            }
        }

        if !overflowed.is_empty() || !gone.is_empty() {
            let mut subs = self.subscribers.write().await;
            for ticket in &overflowed {
                if let Some(sub) = take_attached(&mut subs, ticket) {
                    warn!(session_id = %ticket.id, capacity = OUTBOUND_QUEUE, "Outbound queue overflow, closing session");
                    sub.closer.cancel();
                }
            }
            for ticket in &gone {
                if take_attached(&mut subs, ticket).is_some() {
                    debug!(session_id = %ticket.id, "Removed closed subscriber");
                }
            }
        }

        overflowed
    }
}

/// Removes the entry for `ticket` unless a newer connection has replaced it.
fn take_attached(
    subs: &mut HashMap<SessionId, Subscriber>,
    ticket: &SessionTicket,
) -> Option<Subscriber> {
    match subs.get(&ticket.id) {
        Some(sub) if sub.generation == ticket.generation => subs.remove(&ticket.id),
        _ => None,
    }
}

/// Converts a device event into its pushed wire message.
pub fn event_message(event: &LockEvent) -> Option<ServerMessage> {
    match event {
        LockEvent::Changed {
            device,
            holder,
            mode,
            priority,
            lease_expiry,
            holder_count,
            ..
        } => Some(ServerMessage::LockChanged {
            device: device.clone(),
            holder: holder.clone(),
            mode: *mode,
            priority: *priority,
            lease_expiry: *lease_expiry,
            holder_count: *holder_count,
        }),
        LockEvent::Expired {
            device,
            former_holder,
        } => Some(ServerMessage::LockExpired {
            device: device.clone(),
            former_holder: former_holder.clone(),
        }),
        LockEvent::Preempted {
            device,
            evicted_session,
            new_holder,
        } => Some(ServerMessage::Preempted {
            device: device.clone(),
            evicted_session: evicted_session.clone(),
            new_holder: new_holder.clone(),
        }),
        LockEvent::SessionClosed { .. } => None,
    }
}

/// Spawns the event router task.
///
/// Routes every event of `feed` through the hub. Sessions that overflow
/// their outbound queue are disconnected from the registry.
pub fn spawn_event_router(
    mut feed: mpsc::UnboundedReceiver<LockEvent>,
    registry: RegistryHandle,
    hub: SubscriberHub,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Event router shutting down");
                    break;
                }

                event = feed.recv() => {
                    let Some(event) = event else {
                        debug!("Event feed closed");
                        break;
                    };
                    let overflowed = hub.dispatch(&event).await;
                    disconnect_overflowed(&registry, overflowed).await;
                }
            }
        }
    })
}

async fn disconnect_overflowed(registry: &RegistryHandle, sessions: Vec<SessionTicket>) {
    for ticket in sessions {
        match registry.disconnect_ticket(&ticket, CloseReason::Overflow).await {
            Ok(_) => {}
            Err(e) if e.is_session_unknown() => {}
            Err(e) => warn!(session_id = %ticket.id, error = %e, "Failed to disconnect session"),
        }
    }
}
