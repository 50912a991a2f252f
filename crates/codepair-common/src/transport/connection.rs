//! Connection seam between the pool and a concrete transport.

use miette::Diagnostic;
use n0_future::boxed::BoxFuture;
use tokio::sync::mpsc;

use super::SyncMessage;

/// Error type for transport operations
#[derive(Debug, thiserror::Error, Diagnostic)]
#[diagnostic(code(codepair::transport))]
pub enum TransportError {
    #[error("failed to connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid relay URL {url}")]
    #[diagnostic(help("the sync URL must be an absolute ws:// or wss:// URL"))]
    InvalidUrl { url: String },

    #[error("failed to encode frame")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode frame")]
    Decode(#[source] postcard::Error),

    #[error("not connected; frame dropped")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

/// One live connection to the relay for one session.
///
/// Dropping `outbound` closes the connection; `inbound` yields `None` once the
/// remote side is gone.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<SyncMessage>,
    pub inbound: mpsc::UnboundedReceiver<SyncMessage>,
}

impl Link {
    /// Two in-memory ends wired to each other.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Opens links to the relay.
///
/// Implemented by the WebSocket client and by in-process relays in tests.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, session_id: &str) -> BoxFuture<Result<Link, TransportError>>;
}

impl<C: Connector + ?Sized> Connector for std::sync::Arc<C> {
    fn connect(&self, session_id: &str) -> BoxFuture<Result<Link, TransportError>> {
        (**self).connect(session_id)
    }
}
