//! Error types for CRDT operations.

use miette::Diagnostic;
use thiserror::Error;

use codepair_common::ServiceError;
use codepair_editor_core::EditError;

/// Errors that can occur during replica and session client operations.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CrdtError {
    /// Failed to import CRDT data.
    #[error("failed to import CRDT data: {0}")]
    #[diagnostic(code(crdt::import))]
    Import(String),

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    #[diagnostic(code(crdt::export))]
    Export(String),

    /// A peer sent a version vector we couldn't decode.
    #[error("invalid version vector: {0}")]
    #[diagnostic(code(crdt::version))]
    Version(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(crdt::serialization))]
    Serialization(String),

    /// An edit batch didn't fit the text it was applied to.
    #[error(transparent)]
    #[diagnostic(code(crdt::edit))]
    Edit(#[from] EditError),

    /// Loro CRDT error.
    #[error("loro error: {0}")]
    #[diagnostic(code(crdt::loro))]
    Loro(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Service(#[from] ServiceError),
}

impl From<loro::LoroError> for CrdtError {
    fn from(e: loro::LoroError) -> Self {
        CrdtError::Loro(e.to_string())
    }
}

impl From<loro::LoroEncodeError> for CrdtError {
    fn from(e: loro::LoroEncodeError) -> Self {
        CrdtError::Export(e.to_string())
    }
}

impl From<serde_json::Error> for CrdtError {
    fn from(e: serde_json::Error) -> Self {
        CrdtError::Serialization(e.to_string())
    }
}
