//! Session service: CRUD for sessions and participants plus a push channel
//! of full snapshots.
//!
//! The service is the coarse, authoritative record. Fine-grained text edits
//! travel over the sync transport; the service only sees periodic full-text
//! writes and answers joins, leaves and lookups.

mod memory;
#[cfg(feature = "http")]
mod http;

use std::future::Future;

use n0_future::boxed::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::session::{Language, Participant, Session};

#[cfg(feature = "http")]
pub use http::HttpSessionService;
pub use memory::MemorySessionService;

/// Default roster limit.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 10;

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The participant record created for the caller
    pub user: Participant,
    /// Session state after the join
    pub session: Session,
}

/// Backend that owns session records.
///
/// Every mutation pushes the full updated snapshot to subscribers of that
/// session. Snapshots may arrive out of order relative to the sync stream.
pub trait SessionService: Send + Sync + 'static {
    /// Create a session. Without a language it defaults to JavaScript; the
    /// initial code is the language's starter template.
    fn create_session(
        &self,
        language: Option<Language>,
    ) -> impl Future<Output = Result<Session, ServiceError>> + Send;

    /// Fetch a session, failing with `SessionNotFound` if it doesn't exist.
    fn get_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<Session, ServiceError>> + Send;

    /// Add a participant. Names are unique per session, case-insensitively.
    fn join_session(
        &self,
        session_id: &str,
        username: &str,
    ) -> impl Future<Output = Result<JoinResponse, ServiceError>> + Send;

    fn leave_session(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Replace the session's code, recording `author_id` as `lastModifiedBy`.
    fn update_code(
        &self,
        session_id: &str,
        code: &str,
        author_id: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    fn update_language(
        &self,
        session_id: &str,
        language: &Language,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    fn set_typing(
        &self,
        session_id: &str,
        participant_id: &str,
        is_typing: bool,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Whether `username` could join right now. False for missing sessions.
    fn check_username(
        &self,
        session_id: &str,
        username: &str,
    ) -> impl Future<Output = Result<bool, ServiceError>> + Send;

    /// Stream of full snapshots, one per mutation of the session.
    fn subscribe(&self, session_id: &str) -> BoxStream<Session>;
}
