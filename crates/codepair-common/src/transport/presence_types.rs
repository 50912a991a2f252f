//! Presence types shared by clients and the relay.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::session::{Participant, ParticipantId};

/// What one participant broadcasts about themselves on the sync channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Session participant id (from the session service)
    pub participant_id: ParticipantId,
    /// Display name for UI
    pub display_name: SmolStr,
    /// Assigned colour (CSS hsl string)
    pub color: SmolStr,
    /// Whether the participant is currently typing
    pub is_typing: bool,
}

impl PresenceState {
    /// Presence for a participant record as returned by the session service.
    pub fn from_participant(participant: &Participant) -> Self {
        Self {
            participant_id: participant.id.clone(),
            display_name: participant.username.clone(),
            color: participant.color.clone(),
            is_typing: participant.is_typing,
        }
    }

    pub fn with_typing(mut self, is_typing: bool) -> Self {
        self.is_typing = is_typing;
        self
    }
}
