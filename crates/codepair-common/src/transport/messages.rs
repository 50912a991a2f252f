//! Wire protocol for the sync relay.
//!
//! Frames are postcard-encoded and carried as binary WebSocket messages. The
//! relay understands the same enum, so both sides share this definition.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::PresenceState;

/// Messages exchanged between a replica and the sync relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Ask the relay for everything it has beyond `have_version`.
    SyncRequest {
        /// Encoded version vector of what we already have
        have_version: Vec<u8>,
    },

    /// Relay's answer to a sync request.
    SyncResponse {
        /// Loro update bytes covering the gap
        data: Vec<u8>,
        /// Encoded version vector of the relay's document after the gap
        version: Vec<u8>,
    },

    /// Incremental Loro update, relayed to every other connection.
    Update {
        /// Serialized Loro update bytes
        data: Vec<u8>,
    },

    /// A participant announcing (or refreshing) their presence.
    Presence(PresenceState),

    /// Full set of participants currently present in the room.
    PresenceSnapshot { peers: Vec<PresenceState> },

    /// Participant explicitly left the room.
    Leave { participant_id: SmolStr },
}

/// Versioned wire envelope with a send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireFrame {
    V0 { timestamp: u64, message: SyncMessage },
}

impl SyncMessage {
    /// Serialize message to postcard bytes for wire transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        let frame = WireFrame::V0 {
            timestamp: now_micros(),
            message: self.clone(),
        };
        postcard::to_stdvec(&frame)
    }

    /// Deserialize message from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        let WireFrame::V0 { message, .. } = postcard::from_bytes(bytes)?;
        Ok(message)
    }

    /// Short name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncRequest { .. } => "sync_request",
            SyncMessage::SyncResponse { .. } => "sync_response",
            SyncMessage::Update { .. } => "update",
            SyncMessage::Presence(_) => "presence",
            SyncMessage::PresenceSnapshot { .. } => "presence_snapshot",
            SyncMessage::Leave { .. } => "leave",
        }
    }

    /// True for frames that carry document state.
    pub fn is_document(&self) -> bool {
        matches!(
            self,
            SyncMessage::SyncRequest { .. }
                | SyncMessage::SyncResponse { .. }
                | SyncMessage::Update { .. }
        )
    }
}

fn now_micros() -> u64 {
    use web_time::SystemTime;

    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
