//! Sync relay: one room per session.
//!
//! A room keeps a Loro replica that merges every update passing through it,
//! so a late joiner's sync request can be answered from the room alone. It
//! also tracks presence per connection: a dropped connection takes its
//! presence with it.
//!
//! A room outlives its connections. A client whose link blips comes back to
//! the same merged document instead of racing a newcomer to seed an empty
//! one. Idle rooms are removed by [`Relay::sweep_idle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use codepair_common::telemetry::{counter, gauge};
use codepair_common::transport::{PresenceTracker, SyncMessage};
use codepair_common::{ParticipantId, SessionId};
use codepair_editor_crdt::Replica;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Identifies one connection within the relay.
pub type ConnectionId = u64;

type PresenceKey = (ConnectionId, ParticipantId);

struct Room {
    session_id: SessionId,
    doc: Mutex<Replica>,
    peers: DashMap<ConnectionId, mpsc::UnboundedSender<SyncMessage>>,
    presence: Mutex<PresenceTracker<PresenceKey>>,
    /// When the last connection left. `None` while anyone is connected.
    idle_since: Mutex<Option<Instant>>,
}

impl Room {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            doc: Mutex::new(Replica::new()),
            peers: DashMap::new(),
            presence: Mutex::new(PresenceTracker::new()),
            idle_since: Mutex::new(None),
        }
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if !self.peers.is_empty() {
            return None;
        }
        (*lock(&self.idle_since)).map(|since| now.saturating_duration_since(since))
    }

    fn handle(&self, from: ConnectionId, msg: SyncMessage) {
        match msg {
            SyncMessage::SyncRequest { have_version } => {
                let response = lock(&self.doc).respond_to_sync(&have_version);
                match response {
                    Ok(response) => self.send_to(from, response),
                    Err(e) => {
                        tracing::warn!(session = %self.session_id, connection = from, error = %e, "bad sync request");
                    }
                }
            }
            SyncMessage::Update { data } => {
                if let Err(e) = lock(&self.doc).apply_remote(&data) {
                    tracing::warn!(session = %self.session_id, connection = from, error = %e, "dropping bad update");
                    return;
                }
                counter!("codepair_frames_relayed_total").increment(1);
                self.broadcast_except(from, SyncMessage::Update { data });
            }
            SyncMessage::Presence(state) => {
                let changed =
                    lock(&self.presence).upsert((from, state.participant_id.clone()), state);
                if changed {
                    self.broadcast_presence();
                }
            }
            SyncMessage::Leave { participant_id } => {
                if lock(&self.presence)
                    .remove(&(from, participant_id))
                    .is_some()
                {
                    self.broadcast_presence();
                }
            }
            other => {
                tracing::debug!(session = %self.session_id, connection = from, kind = other.kind(), "ignoring unexpected frame");
            }
        }
    }

    fn presence_snapshot(&self) -> SyncMessage {
        SyncMessage::PresenceSnapshot {
            peers: lock(&self.presence).snapshot(),
        }
    }

    fn broadcast_presence(&self) {
        let snapshot = self.presence_snapshot();
        for peer in self.peers.iter() {
            let _ = peer.value().send(snapshot.clone());
        }
    }

    fn broadcast_except(&self, from: ConnectionId, msg: SyncMessage) {
        for peer in self.peers.iter().filter(|peer| *peer.key() != from) {
            let _ = peer.value().send(msg.clone());
        }
    }

    fn send_to(&self, to: ConnectionId, msg: SyncMessage) {
        if let Some(peer) = self.peers.get(&to) {
            let _ = peer.send(msg);
        }
    }
}

struct RelayInner {
    rooms: DashMap<SessionId, Arc<Room>>,
    next_connection: AtomicU64,
}

/// Relay state shared by every connection. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                rooms: DashMap::new(),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Add a connection to a session's room, creating the room if needed.
    ///
    /// Frames for the connection arrive on the returned receiver. Dropping
    /// the [`RelayConnection`] removes it and its presence.
    pub fn join(&self, session_id: &str) -> (RelayConnection, mpsc::UnboundedReceiver<SyncMessage>) {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let room = {
            let entry = self
                .inner
                .rooms
                .entry(SessionId::from(session_id))
                .or_insert_with(|| {
                    gauge!("codepair_rooms_active").increment(1.0);
                    tracing::info!(session = %session_id, "room opened");
                    Arc::new(Room::new(session_id.into()))
                });
            // Under the entry lock so a concurrent sweep can't drop the room.
            entry.peers.insert(id, tx.clone());
            *lock(&entry.idle_since) = None;
            entry.clone()
        };

        let _ = tx.send(room.presence_snapshot());
        tracing::debug!(session = %session_id, connection = id, peers = room.peers.len(), "connection joined");
        (
            RelayConnection {
                id,
                room,
                relay: self.inner.clone(),
            },
            rx,
        )
    }

    /// Rooms held in memory, idle ones included.
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Remove rooms nobody has been connected to for at least `max_idle`.
    /// Returns how many were removed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.rooms.len();
        self.inner.rooms.retain(|session_id, room| {
            let expired = room.idle_for(now).is_some_and(|idle| idle >= max_idle);
            if expired {
                tracing::info!(session = %session_id, "idle room closed");
            }
            !expired
        });
        let removed = before.saturating_sub(self.inner.rooms.len());
        if removed > 0 {
            gauge!("codepair_rooms_active").decrement(removed as f64);
        }
        removed
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.inner
            .rooms
            .get(session_id)
            .map(|room| room.peers.len())
            .unwrap_or(0)
    }

    /// The merged text a room holds, if the room is open.
    pub fn room_text(&self, session_id: &str) -> Option<String> {
        let room = self.inner.rooms.get(session_id)?.clone();
        let text = lock(&room.doc).current_text();
        Some(text)
    }
}

impl RelayInner {
    fn release(&self, room: &Arc<Room>, id: ConnectionId) {
        // Marked under the room's entry lock so it can't interleave with a join.
        if let Some(current) = self.rooms.get(&room.session_id) {
            current.peers.remove(&id);
            if current.peers.is_empty() {
                *lock(&current.idle_since) = Some(Instant::now());
                tracing::debug!(session = %room.session_id, "room idle");
            }
        } else {
            room.peers.remove(&id);
        }
        let dropped = lock(&room.presence).retain(|(connection, _), _| *connection != id);
        if dropped > 0 {
            room.broadcast_presence();
        }
    }
}

/// One connection's membership in a room.
pub struct RelayConnection {
    id: ConnectionId,
    room: Arc<Room>,
    relay: Arc<RelayInner>,
}

impl RelayConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.room.session_id
    }

    /// Process one frame from this connection.
    pub fn handle(&self, msg: SyncMessage) {
        tracing::trace!(session = %self.room.session_id, connection = self.id, kind = msg.kind(), "frame");
        self.room.handle(self.id, msg);
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        tracing::debug!(session = %self.room.session_id, connection = self.id, "connection left");
        self.relay.release(&self.room, self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codepair_common::transport::PresenceState;

    fn presence(id: &str) -> PresenceState {
        PresenceState {
            participant_id: id.into(),
            display_name: id.into(),
            color: "hsl(200, 70%, 50%)".into(),
            is_typing: false,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_updates_relayed_to_others_and_merged() {
        let relay = Relay::new();
        let (a, mut a_rx) = relay.join("room0001");
        let (_b, mut b_rx) = relay.join("room0001");
        drain(&mut a_rx);
        drain(&mut b_rx);

        let mut author = Replica::new();
        author.apply_local_insert(0, "x=1").unwrap();
        for data in author.take_pending() {
            a.handle(SyncMessage::Update { data });
        }

        assert!(drain(&mut a_rx).is_empty());
        assert!(matches!(
            drain(&mut b_rx).as_slice(),
            [SyncMessage::Update { .. }]
        ));
        assert_eq!(relay.room_text("room0001").as_deref(), Some("x=1"));
    }

    #[test]
    fn test_sync_request_answered_from_room() {
        let relay = Relay::new();
        let (a, _a_rx) = relay.join("room0001");
        let mut author = Replica::new();
        author.apply_local_insert(0, "print(1)").unwrap();
        for data in author.take_pending() {
            a.handle(SyncMessage::Update { data });
        }

        let (late, mut late_rx) = relay.join("room0001");
        let mut replica = Replica::new();
        drain(&mut late_rx);
        late.handle(replica.sync_request());

        let Some(SyncMessage::SyncResponse { data, version }) = drain(&mut late_rx).pop() else {
            panic!("expected a sync response");
        };
        replica.handle_sync_response(&data, &version).unwrap();
        assert_eq!(replica.current_text(), "print(1)");
    }

    #[test]
    fn test_presence_follows_connections() {
        let relay = Relay::new();
        let (a, mut a_rx) = relay.join("room0001");
        let (b, mut b_rx) = relay.join("room0001");
        a.handle(SyncMessage::Presence(presence("ada")));
        b.handle(SyncMessage::Presence(presence("grace")));

        let last = drain(&mut a_rx).pop();
        assert_eq!(
            last,
            Some(SyncMessage::PresenceSnapshot {
                peers: vec![presence("ada"), presence("grace")]
            })
        );

        drain(&mut b_rx);
        drop(a);
        assert_eq!(
            drain(&mut b_rx).pop(),
            Some(SyncMessage::PresenceSnapshot {
                peers: vec![presence("grace")]
            })
        );

        b.handle(SyncMessage::Leave {
            participant_id: "grace".into(),
        });
        assert_eq!(
            drain(&mut b_rx).pop(),
            Some(SyncMessage::PresenceSnapshot { peers: vec![] })
        );
    }

    #[test]
    fn test_room_outlives_its_connections() {
        let relay = Relay::new();
        let (a, _a_rx) = relay.join("room0001");
        let mut author = Replica::new();
        author.apply_local_insert(0, "x = 1\n").unwrap();
        for data in author.take_pending() {
            a.handle(SyncMessage::Update { data });
        }
        drop(a);
        assert_eq!(relay.room_count(), 1);
        assert_eq!(relay.connection_count("room0001"), 0);

        // A newcomer during the gap gets the merged document, not an empty room.
        let (late, mut late_rx) = relay.join("room0001");
        let mut replica = Replica::new();
        drain(&mut late_rx);
        late.handle(replica.sync_request());
        let Some(SyncMessage::SyncResponse { data, version }) = drain(&mut late_rx).pop() else {
            panic!("expected a sync response");
        };
        replica.handle_sync_response(&data, &version).unwrap();
        assert_eq!(replica.current_text(), "x = 1\n");

        assert_eq!(relay.sweep_idle(Duration::ZERO), 0);
        drop(late);
        assert_eq!(relay.sweep_idle(Duration::from_secs(3600)), 0);
        assert_eq!(relay.sweep_idle(Duration::ZERO), 1);
        assert_eq!(relay.room_count(), 0);
        assert_eq!(relay.room_text("room0001"), None);
    }
}
