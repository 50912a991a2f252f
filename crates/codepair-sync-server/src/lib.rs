//! Sync relay for codepair sessions.
//!
//! Each session gets a room holding a merged Loro replica and the presence of
//! every connection in it. Clients reach a room over WebSocket at
//! `/sync/{session_id}`, or in-process through [`LocalConnector`].

pub mod config;
pub mod error;
pub mod local;
pub mod relay;
pub mod server;

pub use config::{Config, ServerConfig};
pub use error::ServerError;
pub use local::LocalConnector;
pub use relay::{ConnectionId, Relay, RelayConnection};
pub use server::{AppState, router, run, spawn_idle_sweeper};
