//! SharedConnection - one relay connection per session, shared by subscribers.
//!
//! The connection task owns the reconnect loop. Subscribers never see the
//! socket: they get [`SessionEvent`]s and send through the current outbound
//! channel, which is `None` while disconnected.
//!
//! The relay treats the connection as one peer, so subscribers sharing it
//! are served locally: updates one of them sends are echoed to the others,
//! and each sync response goes back to the subscriber that asked for it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use super::{Connector, Link, PresenceState, SyncMessage, TransportError};
use crate::session::SessionId;

/// Connection state of a session's relay link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First attempt in flight
    Connecting,
    /// Link is up
    Connected,
    /// Waiting out the fixed interval before attempt number `attempt`
    Reconnecting {
        attempt: u32,
        last_error: Option<SmolStr>,
    },
    /// Nobody is subscribed; no further attempts will be made
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Events delivered to each subscriber of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The link (re)connected. Replicas should request a sync.
    Connected,

    /// The link dropped. Sends fail until the next `Connected`.
    Disconnected { reason: SmolStr },

    /// A document or presence frame from the relay.
    Message(SyncMessage),

    /// The set of present participants changed.
    PresenceChanged(Vec<PresenceState>),
}

#[derive(Debug)]
struct Subscriber {
    events: mpsc::UnboundedSender<SessionEvent>,
    presence: Option<PresenceState>,
}

pub(crate) struct SharedConnection {
    session_id: SessionId,
    subscribers: DashMap<u64, Subscriber>,
    outbound: watch::Sender<Option<mpsc::UnboundedSender<SyncMessage>>>,
    status: watch::Sender<ConnectionStatus>,
    synced: watch::Sender<bool>,
    presence: watch::Sender<Vec<PresenceState>>,
    /// Subscribers with a sync request in flight, oldest first.
    sync_waiters: Mutex<VecDeque<u64>>,
    hydration_claimed: AtomicBool,
    task: OnceLock<AbortHandle>,
}

impl SharedConnection {
    pub(crate) fn new(session_id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            subscribers: DashMap::new(),
            outbound: watch::Sender::new(None),
            status: watch::Sender::new(ConnectionStatus::Connecting),
            synced: watch::Sender::new(false),
            presence: watch::Sender::new(Vec::new()),
            sync_waiters: Mutex::new(VecDeque::new()),
            hydration_claimed: AtomicBool::new(false),
            task: OnceLock::new(),
        })
    }

    pub(crate) fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub(crate) fn set_task(&self, handle: AbortHandle) {
        let _ = self.task.set(handle);
    }

    /// Register a subscriber and catch it up on the current state.
    pub(crate) fn add_subscriber(&self, id: u64) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.status.borrow().is_connected() {
            let _ = tx.send(SessionEvent::Connected);
        }
        let present = self.presence.borrow().clone();
        if !present.is_empty() {
            let _ = tx.send(SessionEvent::PresenceChanged(present));
        }
        self.subscribers.insert(
            id,
            Subscriber {
                events: tx,
                presence: None,
            },
        );
        tracing::trace!(session = %self.session_id, subscriber = id, "subscribed");
        rx
    }

    /// Remove a subscriber, announcing its departure. Returns true if it was the last.
    pub(crate) fn remove_subscriber(&self, id: u64) -> bool {
        if let Some((_, sub)) = self.subscribers.remove(&id) {
            if let Some(presence) = sub.presence {
                let _ = self.send(SyncMessage::Leave {
                    participant_id: presence.participant_id,
                });
            }
        }
        tracing::trace!(session = %self.session_id, subscriber = id, "unsubscribed");
        self.subscribers.is_empty()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send a frame on the current link.
    pub(crate) fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        match self.outbound.borrow().as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Send a frame on behalf of subscriber `from`.
    ///
    /// Sync requests are remembered so the answer goes back to `from`;
    /// updates that made it onto the link are echoed to the other
    /// subscribers.
    pub(crate) fn send_from(&self, from: u64, msg: SyncMessage) -> Result<(), TransportError> {
        match &msg {
            SyncMessage::SyncRequest { .. } => {
                let mut waiters = self.waiters();
                self.send(msg)?;
                waiters.push_back(from);
            }
            SyncMessage::Update { .. } => {
                self.send(msg.clone())?;
                for sub in self.subscribers.iter().filter(|sub| *sub.key() != from) {
                    let _ = sub.events.send(SessionEvent::Message(msg.clone()));
                }
            }
            _ => self.send(msg)?,
        }
        Ok(())
    }

    /// Claim the right to seed an empty document for this connection.
    ///
    /// Only the first caller gets true; later subscribers receive the seed
    /// through its echoed update.
    pub(crate) fn claim_hydration(&self) -> bool {
        !self.hydration_claimed.swap(true, Ordering::AcqRel)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, VecDeque<u64>> {
        self.sync_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a subscriber's presence and announce it if connected.
    pub(crate) fn set_presence(&self, id: u64, state: PresenceState) {
        if let Some(mut sub) = self.subscribers.get_mut(&id) {
            sub.presence = Some(state.clone());
        }
        // Re-announced on the next connect if this fails.
        let _ = self.send(SyncMessage::Presence(state));
    }

    /// Clear a subscriber's presence, telling the relay they left.
    pub(crate) fn clear_presence(&self, id: u64) {
        let previous = self
            .subscribers
            .get_mut(&id)
            .and_then(|mut sub| sub.presence.take());
        if let Some(presence) = previous {
            let _ = self.send(SyncMessage::Leave {
                participant_id: presence.participant_id,
            });
        }
    }

    pub(crate) fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub(crate) fn presence(&self) -> watch::Receiver<Vec<PresenceState>> {
        self.presence.subscribe()
    }

    fn broadcast(&self, event: SessionEvent) {
        for sub in self.subscribers.iter() {
            let _ = sub.events.send(event.clone());
        }
    }

    fn attach(&self, outbound: mpsc::UnboundedSender<SyncMessage>) {
        self.outbound.send_replace(Some(outbound));
        self.status.send_replace(ConnectionStatus::Connected);

        let announcements: Vec<PresenceState> = self
            .subscribers
            .iter()
            .filter_map(|sub| sub.presence.clone())
            .collect();
        for state in announcements {
            let _ = self.send(SyncMessage::Presence(state));
        }

        self.broadcast(SessionEvent::Connected);
    }

    fn detach(&self, reason: &str) {
        self.outbound.send_replace(None);
        self.waiters().clear();
        self.synced.send_replace(false);
        self.presence.send_replace(Vec::new());
        self.broadcast(SessionEvent::Disconnected {
            reason: reason.into(),
        });
        self.broadcast(SessionEvent::PresenceChanged(Vec::new()));
    }

    fn handle_inbound(&self, msg: SyncMessage) {
        match msg {
            SyncMessage::PresenceSnapshot { peers } => {
                self.presence.send_replace(peers.clone());
                self.broadcast(SessionEvent::PresenceChanged(peers));
            }
            msg @ SyncMessage::SyncResponse { .. } => {
                self.synced.send_replace(true);
                let waiter = self.waiters().pop_front();
                let delivered = waiter
                    .and_then(|id| self.subscribers.get(&id))
                    .is_some_and(|sub| sub.events.send(SessionEvent::Message(msg.clone())).is_ok());
                if !delivered {
                    self.broadcast(SessionEvent::Message(msg));
                }
            }
            msg => self.broadcast(SessionEvent::Message(msg)),
        }
    }

    /// Stop the connection task and mark the session disconnected.
    pub(crate) fn shutdown(&self) {
        if let Some(task) = self.task.get() {
            task.abort();
        }
        self.outbound.send_replace(None);
        self.synced.send_replace(false);
        self.presence.send_replace(Vec::new());
        self.status.send_replace(ConnectionStatus::Disconnected);
        tracing::debug!(session = %self.session_id, "sync connection shut down");
    }

    /// Connect, pump frames until the link drops, wait out the interval, repeat.
    ///
    /// Attempts start at least `interval` apart, measured start to start.
    pub(crate) async fn run(self: Arc<Self>, connector: Arc<dyn Connector>, interval: Duration) {
        let mut attempt: u32 = 0;
        loop {
            let started = tokio::time::Instant::now();
            let last_error = match connector.connect(&self.session_id).await {
                Ok(Link {
                    outbound,
                    mut inbound,
                }) => {
                    tracing::info!(session = %self.session_id, "connected to sync relay");
                    attempt = 0;
                    self.attach(outbound);
                    while let Some(msg) = inbound.recv().await {
                        self.handle_inbound(msg);
                    }
                    tracing::warn!(session = %self.session_id, "sync connection lost");
                    self.detach("connection closed");
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        session = %self.session_id,
                        attempt,
                        error = %e,
                        "failed to connect to sync relay"
                    );
                    Some(SmolStr::new(e.to_string()))
                }
            };

            attempt = attempt.saturating_add(1);
            self.status
                .send_replace(ConnectionStatus::Reconnecting { attempt, last_error });
            metrics::counter!("codepair_reconnects_total").increment(1);
            tokio::time::sleep_until(started + interval).await;
        }
    }
}
