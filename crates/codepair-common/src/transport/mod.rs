//! Real-time sync transport.
//!
//! - `ConnectionPool`: one shared relay connection per session, reconnecting
//!   on a fixed interval, released when the last subscriber goes away
//! - `SyncMessage`: wire protocol for CRDT updates, sync handshakes and presence
//! - `PresenceTracker`: who is in a room and who is typing
//! - `WebSocketConnector`: the production `Connector`

mod connection;
mod messages;
mod pool;
mod presence;
mod presence_types;
mod session;
#[cfg(feature = "websocket")]
mod websocket;

pub use connection::{Connector, Link, TransportError};
pub use messages::SyncMessage;
pub use pool::{ConnectionPool, SessionSubscription};
pub use presence::PresenceTracker;
pub use presence_types::PresenceState;
pub use session::{ConnectionStatus, SessionEvent};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
