//! In-process connector onto a [`Relay`].
//!
//! Lets clients in the same process (tests, embedded setups) reach the relay
//! without a socket. Each link gets a bridge task between the pool's end and
//! the relay connection; aborting it looks to the pool like a dropped socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use codepair_common::transport::{Connector, Link, SyncMessage, TransportError};
use n0_future::boxed::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::relay::{Relay, RelayConnection};

#[derive(Debug)]
struct LocalState {
    online: AtomicBool,
    bridges: Mutex<Vec<AbortHandle>>,
}

/// Connector that links straight into a relay in the same process.
#[derive(Clone)]
pub struct LocalConnector {
    relay: Relay,
    state: Arc<LocalState>,
}

impl LocalConnector {
    pub fn new(relay: Relay) -> Self {
        Self {
            relay,
            state: Arc::new(LocalState {
                online: AtomicBool::new(true),
                bridges: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// While offline, new connection attempts fail.
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::Release);
    }

    /// Cut every open link, as if the network went away.
    pub fn drop_connections(&self) {
        let bridges = std::mem::take(
            &mut *self
                .state
                .bridges
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::debug!(links = bridges.len(), "dropping local relay links");
        for bridge in bridges {
            bridge.abort();
        }
    }
}

impl Connector for LocalConnector {
    fn connect(&self, session_id: &str) -> BoxFuture<Result<Link, TransportError>> {
        let relay = self.relay.clone();
        let state = self.state.clone();
        let session_id = session_id.to_string();
        Box::pin(async move {
            if !state.online.load(Ordering::Acquire) {
                return Err(TransportError::Connect {
                    target: format!("local:{session_id}"),
                    source: "relay unreachable".into(),
                });
            }

            let (pool_side, relay_side) = Link::pair();
            let (connection, from_relay) = relay.join(&session_id);
            let bridge = tokio::spawn(bridge(connection, from_relay, relay_side));
            state
                .bridges
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(bridge.abort_handle());
            Ok(pool_side)
        })
    }
}

async fn bridge(
    connection: RelayConnection,
    mut from_relay: mpsc::UnboundedReceiver<SyncMessage>,
    link: Link,
) {
    let Link {
        outbound,
        mut inbound,
    } = link;
    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(msg) => connection.handle(msg),
                None => break,
            },
            msg = from_relay.recv() => match msg {
                Some(msg) => {
                    if outbound.send(msg).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    tracing::trace!(connection = connection.id(), "local bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_refuses_connections() {
        let connector = LocalConnector::new(Relay::new());
        connector.set_online(false);
        assert!(matches!(
            connector.connect("room0001").await,
            Err(TransportError::Connect { .. })
        ));

        connector.set_online(true);
        let mut link = connector.connect("room0001").await.unwrap();
        assert!(matches!(
            link.inbound.recv().await,
            Some(SyncMessage::PresenceSnapshot { .. })
        ));
        assert_eq!(connector.relay().connection_count("room0001"), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_closes_links() {
        let connector = LocalConnector::new(Relay::new());
        let mut link = connector.connect("room0001").await.unwrap();
        let _ = link.inbound.recv().await;

        connector.drop_connections();
        assert_eq!(link.inbound.recv().await, None);
        assert_eq!(connector.relay().connection_count("room0001"), 0);
        assert_eq!(connector.relay().room_count(), 1);
    }
}
