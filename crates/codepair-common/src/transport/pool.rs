//! ConnectionPool - reference-counted relay connections keyed by session.
//!
//! Every caller that subscribes to the same session shares one link. The link
//! is torn down when the last [`SessionSubscription`] is dropped.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::watch;

use super::session::SharedConnection;
use super::{ConnectionStatus, Connector, PresenceState, SessionEvent, SyncMessage, TransportError};
use crate::config::TransportConfig;
use crate::session::{ParticipantId, SessionId};

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    sessions: DashMap<SessionId, Arc<SharedConnection>>,
    next_subscriber: AtomicU64,
}

/// Hands out shared relay connections.
///
/// Cheap to clone; clones share the same set of connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(connector: impl Connector, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector: Arc::new(connector),
                config,
                sessions: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to a session, opening its connection if this is the first subscriber.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, session_id: &str) -> SessionSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .inner
            .sessions
            .entry(SessionId::new(session_id))
            .or_insert_with(|| {
                tracing::debug!(session = session_id, "opening sync connection");
                let shared = SharedConnection::new(SessionId::new(session_id));
                let task = tokio::spawn(
                    shared
                        .clone()
                        .run(self.inner.connector.clone(), self.inner.config.reconnect_interval),
                );
                shared.set_task(task.abort_handle());
                shared
            });
        let shared = entry.value().clone();
        // Registered under the entry lock so a concurrent release can't tear it down.
        let events = shared.add_subscriber(id);
        drop(entry);

        SessionSubscription {
            id,
            shared,
            pool: Arc::downgrade(&self.inner),
            events,
        }
    }

    /// Release a subscription. Equivalent to dropping it.
    pub fn disconnect(&self, subscription: SessionSubscription) {
        drop(subscription);
    }

    /// Number of sessions with an open (or reconnecting) connection.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of live subscriptions to a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .get(session_id)
            .map(|shared| shared.subscriber_count())
            .unwrap_or(0)
    }
}

impl PoolInner {
    fn release(&self, shared: &Arc<SharedConnection>, id: u64) {
        let mut handled = false;
        let removed = self
            .sessions
            .remove_if(shared.session_id().as_str(), |_, current| {
                if !Arc::ptr_eq(current, shared) {
                    return false;
                }
                handled = true;
                current.remove_subscriber(id)
            });

        if removed.is_some() {
            shared.shutdown();
        } else if !handled && shared.remove_subscriber(id) {
            shared.shutdown();
        }
    }
}

/// A caller's handle on a shared session connection.
///
/// Dropping the handle unsubscribes; the last drop closes the connection.
pub struct SessionSubscription {
    id: u64,
    shared: Arc<SharedConnection>,
    pool: Weak<PoolInner>,
    events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Send a frame to the relay.
    ///
    /// Fails with [`TransportError::NotConnected`] while the link is down;
    /// callers keep the data and resend after the next `Connected`.
    pub fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        self.shared.send_from(self.id, msg)
    }

    /// True for the first subscriber on this connection to ask.
    ///
    /// Subscribers sharing a connection share the relay's view of the
    /// document, so only one of them may seed it.
    pub fn claim_hydration(&self) -> bool {
        self.shared.claim_hydration()
    }

    /// Announce local presence now and after every reconnect.
    pub fn set_presence(&self, state: PresenceState) {
        self.shared.set_presence(self.id, state);
    }

    /// Withdraw local presence.
    pub fn leave(&self) {
        self.shared.clear_presence(self.id);
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status().borrow().is_connected()
    }

    /// True once the relay has answered a sync request on the current link.
    pub fn is_synced(&self) -> bool {
        *self.shared.synced().borrow()
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.shared.synced()
    }

    /// Live presence list, updated on every snapshot from the relay.
    pub fn online(&self) -> watch::Receiver<Vec<PresenceState>> {
        self.shared.presence()
    }

    pub fn online_ids(&self) -> BTreeSet<ParticipantId> {
        self.shared
            .presence()
            .borrow()
            .iter()
            .map(|p| p.participant_id.clone())
            .collect()
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        match self.pool.upgrade() {
            Some(pool) => pool.release(&self.shared, self.id),
            None => {
                if self.shared.remove_subscriber(self.id) {
                    self.shared.shutdown();
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSubscription")
            .field("session_id", self.shared.session_id())
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use n0_future::boxed::BoxFuture;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::Link;

    struct TestConnector {
        attempts: AtomicUsize,
        accept: AtomicBool,
        links: mpsc::UnboundedSender<Link>,
    }

    impl Connector for TestConnector {
        fn connect(&self, _session_id: &str) -> BoxFuture<Result<Link, TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = if self.accept.load(Ordering::SeqCst) {
                let (client, server) = Link::pair();
                let _ = self.links.send(server);
                Ok(client)
            } else {
                Err(TransportError::Closed)
            };
            Box::pin(async move { result })
        }
    }

    fn setup(accept: bool) -> (Arc<TestConnector>, mpsc::UnboundedReceiver<Link>, ConnectionPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(TestConnector {
            attempts: AtomicUsize::new(0),
            accept: AtomicBool::new(accept),
            links: tx,
        });
        let pool = ConnectionPool::new(
            connector.clone(),
            TransportConfig {
                reconnect_interval: Duration::from_secs(3),
            },
        );
        (connector, rx, pool)
    }

    fn presence(id: &str) -> PresenceState {
        PresenceState {
            participant_id: id.into(),
            display_name: id.into(),
            color: "hsl(0, 70%, 50%)".into(),
            is_typing: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_share_one_connection() {
        let (connector, mut links, pool) = setup(true);

        let mut first = pool.connect("room1");
        let second = pool.connect("room1");
        assert_eq!(first.next_event().await, Some(SessionEvent::Connected));
        let mut server = links.recv().await.unwrap();

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_sessions(), 1);
        assert_eq!(pool.subscriber_count("room1"), 2);

        drop(second);
        assert_eq!(pool.active_sessions(), 1);

        pool.disconnect(first);
        assert_eq!(pool.active_sessions(), 0);
        assert_eq!(server.inbound.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_and_sync_state() {
        let (_connector, mut links, pool) = setup(true);
        let mut sub = pool.connect("room1");
        sub.set_presence(presence("alice"));
        assert_eq!(sub.next_event().await, Some(SessionEvent::Connected));
        let mut server = links.recv().await.unwrap();

        // Presence set before the link came up is announced on connect.
        assert_eq!(
            server.inbound.recv().await,
            Some(SyncMessage::Presence(presence("alice")))
        );

        server
            .outbound
            .send(SyncMessage::PresenceSnapshot {
                peers: vec![presence("alice"), presence("bob")],
            })
            .unwrap();
        assert!(matches!(
            sub.next_event().await,
            Some(SessionEvent::PresenceChanged(peers)) if peers.len() == 2
        ));
        assert!(sub.online_ids().contains("bob"));
        assert!(!sub.is_synced());

        server
            .outbound
            .send(SyncMessage::SyncResponse {
                data: vec![],
                version: vec![],
            })
            .unwrap();
        assert!(matches!(
            sub.next_event().await,
            Some(SessionEvent::Message(SyncMessage::SyncResponse { .. }))
        ));
        assert!(sub.is_synced());

        drop(server);
        assert!(matches!(
            sub.next_event().await,
            Some(SessionEvent::Disconnected { .. })
        ));
        assert!(!sub.is_synced());
        assert!(sub.online_ids().is_empty());
        assert!(matches!(
            sub.send(SyncMessage::Update { data: vec![1] }),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_waits_fixed_interval() {
        let (connector, mut links, pool) = setup(false);
        let mut sub = pool.connect("room1");

        tokio::time::sleep(Duration::from_secs(7)).await;
        // Attempts at t=0, 3 and 6.
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(
            *sub.status().borrow(),
            ConnectionStatus::Reconnecting { attempt: 3, .. }
        ));

        connector.accept.store(true, Ordering::SeqCst);
        assert_eq!(sub.next_event().await, Some(SessionEvent::Connected));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert!(links.recv().await.is_some());
        assert!(sub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_sends_leave_frame() {
        let (_connector, mut links, pool) = setup(true);
        let mut sub = pool.connect("room1");
        assert_eq!(sub.next_event().await, Some(SessionEvent::Connected));
        let mut server = links.recv().await.unwrap();

        sub.set_presence(presence("alice"));
        sub.leave();
        assert_eq!(
            server.inbound.recv().await,
            Some(SyncMessage::Presence(presence("alice")))
        );
        assert_eq!(
            server.inbound.recv().await,
            Some(SyncMessage::Leave {
                participant_id: "alice".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_siblings_on_one_connection() {
        let (_connector, mut links, pool) = setup(true);
        let mut first = pool.connect("room1");
        let mut second = pool.connect("room1");
        assert_eq!(first.next_event().await, Some(SessionEvent::Connected));
        assert_eq!(second.next_event().await, Some(SessionEvent::Connected));
        let mut server = links.recv().await.unwrap();

        // Each sync answer goes to the subscriber that asked.
        second
            .send(SyncMessage::SyncRequest { have_version: vec![2] })
            .unwrap();
        first
            .send(SyncMessage::SyncRequest { have_version: vec![1] })
            .unwrap();
        for version in [2, 1] {
            assert_eq!(
                server.inbound.recv().await,
                Some(SyncMessage::SyncRequest { have_version: vec![version] })
            );
            server
                .outbound
                .send(SyncMessage::SyncResponse {
                    data: vec![],
                    version: vec![version],
                })
                .unwrap();
        }
        assert_eq!(
            second.next_event().await,
            Some(SessionEvent::Message(SyncMessage::SyncResponse {
                data: vec![],
                version: vec![2]
            }))
        );
        assert_eq!(
            first.next_event().await,
            Some(SessionEvent::Message(SyncMessage::SyncResponse {
                data: vec![],
                version: vec![1]
            }))
        );
        assert_eq!(first.try_next_event(), None);
        assert_eq!(second.try_next_event(), None);

        // Updates reach the relay and the sibling, not the sender.
        first.send(SyncMessage::Update { data: vec![9] }).unwrap();
        assert_eq!(
            server.inbound.recv().await,
            Some(SyncMessage::Update { data: vec![9] })
        );
        assert_eq!(
            second.try_next_event(),
            Some(SessionEvent::Message(SyncMessage::Update { data: vec![9] }))
        );
        assert_eq!(first.try_next_event(), None);

        assert!(first.claim_hydration());
        assert!(!second.claim_hydration());
    }
}
