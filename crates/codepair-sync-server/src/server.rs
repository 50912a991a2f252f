//! HTTP surface of the sync relay.
//!
//! - `GET /sync/{session_id}`: WebSocket carrying postcard `SyncMessage` frames
//! - `GET /health`: liveness plus room count
//! - `GET /metrics`: prometheus text

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use codepair_common::telemetry;
use codepair_common::transport::SyncMessage;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::relay::{Relay, RelayConnection};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(relay: Relay, config: &ServerConfig) -> Self {
        Self {
            relay,
            max_message_size: config.max_message_size,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/{session_id}", get(sync_socket))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically close rooms that have had no connections for `max_idle`.
pub fn spawn_idle_sweeper(relay: Relay, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = relay.sweep_idle(max_idle);
            if removed > 0 {
                tracing::debug!(removed, remaining = relay.room_count(), "swept idle rooms");
            }
        }
    })
}

/// Bind and serve until the listener fails.
pub async fn run(state: AppState, config: &ServerConfig) -> Result<(), ServerError> {
    let listener =
        TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
    tracing::info!(addr = %config.listen_addr, "sync relay listening");
    let sweeper = spawn_idle_sweeper(
        state.relay.clone(),
        config.sweep_interval(),
        config.room_idle_timeout(),
    );
    let served = axum::serve(listener, router(state))
        .await
        .map_err(|source| ServerError::Serve { source });
    sweeper.abort();
    served
}

async fn metrics() -> String {
    telemetry::render()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    rooms: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok",
        rooms: state.relay.room_count(),
    };
    (StatusCode::OK, Json(response))
}

async fn sync_socket(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (connection, outbound) = state.relay.join(&session_id);
            handle_socket(socket, connection, outbound).await;
        })
}

async fn handle_socket(
    mut socket: WebSocket,
    connection: RelayConnection,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<SyncMessage>,
) {
    tracing::debug!(session = connection.session_id(), connection = connection.id(), "socket opened");
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(Message::Binary(data))) => match SyncMessage::from_bytes(&data) {
                    Ok(msg) => connection.handle(msg),
                    Err(e) => {
                        tracing::warn!(connection = connection.id(), error = ?e, "failed to decode sync frame");
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = connection.id(), error = ?e, "socket read failed");
                    break;
                }
            },
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let bytes = match msg.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = ?e, kind = msg.kind(), "failed to encode frame");
                        continue;
                    }
                };
                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(session = connection.session_id(), connection = connection.id(), "socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_closes_idle_rooms() {
        let relay = Relay::new();
        let (connection, _rx) = relay.join("room0001");
        let _sweeper = spawn_idle_sweeper(
            relay.clone(),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(relay.room_count(), 1);

        drop(connection);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(relay.room_count(), 1);
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(relay.room_count(), 0);
    }
}
