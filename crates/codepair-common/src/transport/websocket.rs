//! WebSocket connector for the sync relay.
//!
//! Each connection gets a reader and a writer task. The writer ends when the
//! pool drops its sender; the reader ends when the socket closes, which in
//! turn closes the inbound channel and tells the pool to reconnect.

use futures_util::{SinkExt, StreamExt};
use n0_future::boxed::BoxFuture;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{Connector, Link, SyncMessage, TransportError};

/// Connects to `{base}/sync/{session_id}` over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
}

impl WebSocketConnector {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    /// URL of the relay room for a session.
    pub fn session_url(&self, session_id: &str) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl {
                url: self.base.to_string(),
            })?
            .pop_if_empty()
            .push("sync")
            .push(session_id);
        Ok(url)
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, session_id: &str) -> BoxFuture<Result<Link, TransportError>> {
        let url = self.session_url(session_id);
        Box::pin(async move {
            let url = url?;
            tracing::debug!(%url, "connecting to sync relay");

            let (ws, _response) =
                connect_async(url.as_str())
                    .await
                    .map_err(|e| TransportError::Connect {
                        target: url.to_string(),
                        source: Box::new(e),
                    })?;
            let (mut write, mut read) = ws.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<SyncMessage>();

            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let bytes = match msg.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(error = ?e, kind = msg.kind(), "failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                        tracing::debug!(error = ?e, "websocket write failed");
                        break;
                    }
                }
                let _ = write.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Binary(data)) => match SyncMessage::from_bytes(&data) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = ?e, "failed to decode sync frame");
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            tracing::debug!(?frame, "relay closed connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(error = ?e, "websocket read failed");
                            break;
                        }
                    }
                }
            });

            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
