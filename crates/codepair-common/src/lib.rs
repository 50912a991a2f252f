//! Shared building blocks for codepair: the session model, errors, config,
//! the session service, execution sandboxes and the sync transport.

pub mod config;
pub mod error;
pub mod execute;
pub mod service;
pub mod session;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod transport;

pub use crate::config::{ClientConfig, TransportConfig};
pub use crate::error::{CodepairError, ConfigError, ServiceError, TransportError, ValidationError};
pub use crate::session::{
    ExecutionResult, Language, Participant, ParticipantId, Session, SessionId,
};
