//! In-process session service.

use std::sync::Arc;

use dashmap::DashMap;
use n0_future::boxed::BoxStream;
use n0_future::stream;
use tokio::sync::broadcast;

use super::{DEFAULT_MAX_PARTICIPANTS, JoinResponse, SessionService};
use crate::error::{ServiceError, ValidationError};
use crate::session::{
    Language, Participant, Session, SessionId, generate_participant_id, generate_session_id,
    now_millis, pick_color, validate_session_id, validate_username,
};

const UPDATE_BUFFER: usize = 64;

struct SessionEntry {
    session: Session,
    updates: broadcast::Sender<Session>,
}

impl SessionEntry {
    /// Bump the revision and push the snapshot to subscribers.
    fn publish(&mut self) {
        self.session.revision += 1;
        // No subscribers is fine.
        let _ = self.updates.send(self.session.clone());
    }
}

/// Session service backed by a concurrent map.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemorySessionService {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    max_participants: usize,
}

impl Default for MemorySessionService {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARTICIPANTS)
    }
}

impl MemorySessionService {
    pub fn new(max_participants: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            max_participants,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn not_found(session_id: &str) -> ServiceError {
        ValidationError::SessionNotFound {
            id: session_id.into(),
        }
        .into()
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionEntry) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        validate_session_id(session_id)?;
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        f(&mut entry)
    }
}

impl SessionService for MemorySessionService {
    async fn create_session(&self, language: Option<Language>) -> Result<Session, ServiceError> {
        let language = language.unwrap_or_default();
        let mut id = generate_session_id();
        while self.sessions.contains_key(&id) {
            id = generate_session_id();
        }

        let session = Session {
            id: id.clone(),
            code: language.template().unwrap_or_default().to_string(),
            language,
            users: Vec::new(),
            created_at: now_millis(),
            last_modified_by: None,
            revision: 0,
        };
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                updates,
            },
        );
        tracing::info!(session = %id, language = %session.language, "session created");
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, ServiceError> {
        self.with_entry(session_id, |entry| Ok(entry.session.clone()))
    }

    async fn join_session(
        &self,
        session_id: &str,
        username: &str,
    ) -> Result<JoinResponse, ServiceError> {
        let username = validate_username(username)?;
        let max = self.max_participants;
        self.with_entry(session_id, |entry| {
            if entry.session.is_username_taken(username) {
                return Err(ValidationError::UsernameTaken {
                    username: username.into(),
                }
                .into());
            }
            if entry.session.users.len() >= max {
                return Err(ValidationError::SessionFull {
                    id: session_id.into(),
                    max,
                }
                .into());
            }

            let color = pick_color(&entry.session.colors_in_use(), &mut rand::rng());
            let user = Participant {
                id: generate_participant_id(),
                username: username.into(),
                color,
                is_typing: false,
                last_activity: now_millis(),
            };
            entry.session.users.push(user.clone());
            entry.publish();
            tracing::info!(session = %session_id, participant = %user.id, "participant joined");

            Ok(JoinResponse {
                user,
                session: entry.session.clone(),
            })
        })
    }

    async fn leave_session(&self, session_id: &str, participant_id: &str) -> Result<(), ServiceError> {
        self.with_entry(session_id, |entry| {
            let before = entry.session.users.len();
            entry.session.users.retain(|u| u.id != participant_id);
            if entry.session.users.len() == before {
                return Err(ServiceError::ParticipantNotFound {
                    session_id: session_id.into(),
                    participant_id: participant_id.into(),
                });
            }
            entry.publish();
            tracing::info!(session = %session_id, participant = %participant_id, "participant left");
            Ok(())
        })
    }

    async fn update_code(
        &self,
        session_id: &str,
        code: &str,
        author_id: &str,
    ) -> Result<(), ServiceError> {
        self.with_entry(session_id, |entry| {
            if let Some(author) = entry.session.participant_mut(author_id) {
                author.last_activity = now_millis();
            }
            entry.session.code = code.to_string();
            entry.session.last_modified_by = Some(author_id.into());
            entry.publish();
            Ok(())
        })
    }

    async fn update_language(&self, session_id: &str, language: &Language) -> Result<(), ServiceError> {
        self.with_entry(session_id, |entry| {
            entry.session.language = language.clone();
            entry.publish();
            Ok(())
        })
    }

    async fn set_typing(
        &self,
        session_id: &str,
        participant_id: &str,
        is_typing: bool,
    ) -> Result<(), ServiceError> {
        self.with_entry(session_id, |entry| {
            let participant = entry.session.participant_mut(participant_id).ok_or_else(|| {
                ServiceError::ParticipantNotFound {
                    session_id: session_id.into(),
                    participant_id: participant_id.into(),
                }
            })?;
            if participant.is_typing == is_typing {
                return Ok(());
            }
            participant.is_typing = is_typing;
            participant.last_activity = now_millis();
            entry.publish();
            Ok(())
        })
    }

    async fn check_username(&self, session_id: &str, username: &str) -> Result<bool, ServiceError> {
        let Ok(username) = validate_username(username) else {
            return Ok(false);
        };
        if validate_session_id(session_id).is_err() {
            return Ok(false);
        }
        Ok(self
            .sessions
            .get(session_id)
            .is_some_and(|entry| !entry.session.is_username_taken(username)))
    }

    fn subscribe(&self, session_id: &str) -> BoxStream<Session> {
        let Some(entry) = self.sessions.get(session_id) else {
            return Box::pin(stream::empty());
        };
        let receiver = entry.updates.subscribe();
        drop(entry);

        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(session) => return Some((session, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session update subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Box::pin(stream)
    }
}
