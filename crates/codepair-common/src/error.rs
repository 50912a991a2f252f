//! Error types for codepair.
//!
//! Errors are split by how they propagate: validation errors surface to the
//! caller that asked, service errors wrap whatever the session backend said,
//! and transport errors stay inside the connection pool (they are reported
//! through the status channel rather than returned).

use miette::Diagnostic;
use smol_str::SmolStr;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::transport::TransportError;

/// Top-level error type for codepair operations
#[derive(Debug, Error, Diagnostic)]
pub enum CodepairError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// Configuration loading errors
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    #[diagnostic(code(config::missing_env))]
    MissingEnv { var: &'static str },

    #[error("invalid value {value:?} for {var}: {message}")]
    #[diagnostic(code(config::invalid))]
    Invalid {
        var: &'static str,
        value: String,
        message: String,
    },

    #[error("failed to parse URL {url}: {message}")]
    #[diagnostic(code(config::url_parse))]
    UrlParse { url: String, message: String },

    #[error("error reading config file {}", path.display())]
    #[diagnostic(code(config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing config file {}: {message}", path.display())]
    #[diagnostic(code(config::parse), help("check the TOML syntax and field names"))]
    Parse { path: PathBuf, message: String },
}

/// Errors caused by bad input from the user. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ValidationError {
    #[error("Username is already taken")]
    #[diagnostic(code(codepair::username_taken), help("pick a different display name"))]
    UsernameTaken { username: SmolStr },

    #[error("invalid username: {reason}")]
    #[diagnostic(code(codepair::invalid_username))]
    InvalidUsername { reason: &'static str },

    #[error("malformed session id {id:?}")]
    #[diagnostic(code(codepair::malformed_session_id))]
    MalformedSessionId { id: SmolStr },

    #[error("Session not found")]
    #[diagnostic(code(codepair::session_not_found))]
    SessionNotFound { id: SmolStr },

    #[error("session {id} is full ({max} participants)")]
    #[diagnostic(code(codepair::session_full))]
    SessionFull { id: SmolStr, max: usize },
}

/// Errors returned by a session service backend.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error("participant {participant_id} not found in session {session_id}")]
    #[diagnostic(code(service::participant_not_found))]
    ParticipantNotFound {
        session_id: SmolStr,
        participant_id: SmolStr,
    },

    #[error("session service request failed: {message}")]
    #[diagnostic(code(service::request))]
    Request { message: String },

    #[error("session service returned {status}: {message}")]
    #[diagnostic(code(service::status))]
    Status { status: u16, message: String },

    #[error("failed to decode session service response: {message}")]
    #[diagnostic(code(service::decode))]
    Decode { message: String },
}

impl ServiceError {
    /// True when the error came from user input rather than the backend.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceError::Decode {
                message: e.to_string(),
            }
        } else {
            ServiceError::Request {
                message: e.to_string(),
            }
        }
    }
}
