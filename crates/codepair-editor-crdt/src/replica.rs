//! Replica engine: the local copy of a session's shared document.
//!
//! One Loro document per session holds three containers:
//! - `content` (text): the source code
//! - `session` (map): shared metadata, currently the language tag
//! - `execution` (map): the last run's result, see [`crate::execution`]
//!
//! Every committed local change is captured by a Loro local-update
//! subscription and queued until the session client flushes it to the relay.
//! The queue survives disconnects, so edits made offline go out in the order
//! they were made once the link is back.

use codepair_common::Language;
use codepair_common::transport::SyncMessage;
use codepair_editor_core::{ChangeOrigin, EditBatch, ResolvedEdit, TextBuffer, apply_edits};
use loro::{LoroMap, LoroValue, ValueOrContainer, VersionVector};
use tokio::sync::mpsc;

use crate::buffer::LoroTextBuffer;
use crate::error::CrdtError;
use crate::execution::SharedExecution;

pub const SESSION_CONTAINER: &str = "session";
pub const EXECUTION_CONTAINER: &str = "execution";
const LANGUAGE_KEY: &str = "language";
const LATEST_RESULT_KEY: &str = "latest";

/// What changed in the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaChange {
    /// The resolved text changed.
    Text,
    /// The shared language tag changed.
    Language(Language),
    /// A new execution result landed in the shared slot.
    Execution(SharedExecution),
}

/// A change notification, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEvent {
    pub origin: ChangeOrigin,
    pub change: ReplicaChange,
}

type ChangeCallback = Box<dyn Fn(&ReplicaEvent) + Send + Sync>;

/// Resolved state we diff before and after an import.
#[derive(PartialEq)]
struct Observed {
    text: String,
    language: Option<Language>,
    execution: Option<SharedExecution>,
}

/// Local replica of a session document.
pub struct Replica {
    buffer: LoroTextBuffer,
    session: LoroMap,
    execution: LoroMap,
    local_updates: mpsc::UnboundedReceiver<Vec<u8>>,
    _local_sub: loro::Subscription,
    listeners: Vec<ChangeCallback>,
    hydrated: bool,
}

impl Replica {
    pub fn new() -> Self {
        Self::from_buffer(LoroTextBuffer::new())
    }

    /// Restore a replica from a full snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        Ok(Self::from_buffer(LoroTextBuffer::from_snapshot(snapshot)?))
    }

    fn from_buffer(buffer: LoroTextBuffer) -> Self {
        let (tx, local_updates) = mpsc::unbounded_channel::<Vec<u8>>();
        let sub = buffer
            .doc()
            .subscribe_local_update(Box::new(move |update| {
                // Receiver gone means the replica is being dropped.
                tx.send(update.to_vec()).is_ok()
            }));

        let session = buffer.doc().get_map(SESSION_CONTAINER);
        let execution = buffer.doc().get_map(EXECUTION_CONTAINER);
        Self {
            buffer,
            session,
            execution,
            local_updates,
            _local_sub: sub,
            listeners: Vec::new(),
            hydrated: false,
        }
    }

    /// The underlying buffer, for read access and offset conversion.
    pub fn buffer(&self) -> &LoroTextBuffer {
        &self.buffer
    }

    pub fn current_text(&self) -> String {
        self.buffer.to_string()
    }

    pub fn len_chars(&self) -> usize {
        self.buffer.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Register a callback run whenever the resolved state changes.
    pub fn on_change(&mut self, callback: impl Fn(&ReplicaEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(callback));
    }

    /// Insert text typed by the local user at a char offset.
    pub fn apply_local_insert(&mut self, pos: usize, text: &str) -> Result<(), CrdtError> {
        if text.is_empty() {
            return Ok(());
        }
        self.buffer.content().insert(pos, text)?;
        self.commit(ChangeOrigin::Local, ReplicaChange::Text);
        Ok(())
    }

    /// Delete `len` chars starting at `pos`, on behalf of the local user.
    pub fn apply_local_delete(&mut self, pos: usize, len: usize) -> Result<(), CrdtError> {
        if len == 0 {
            return Ok(());
        }
        self.buffer.content().delete(pos, len)?;
        self.commit(ChangeOrigin::Local, ReplicaChange::Text);
        Ok(())
    }

    /// Apply a positional edit batch as one committed change.
    ///
    /// Nothing is applied if any edit fails to resolve.
    pub fn apply_batch(
        &mut self,
        batch: &EditBatch,
        origin: ChangeOrigin,
    ) -> Result<Vec<ResolvedEdit>, CrdtError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let resolved = apply_edits(&mut self.buffer, batch)?;
        self.commit(origin, ReplicaChange::Text);
        Ok(resolved)
    }

    /// Merge operations from a peer. Returns true if the text changed.
    ///
    /// Operations already seen are skipped, so redelivery is harmless.
    pub fn apply_remote(&mut self, data: &[u8]) -> Result<bool, CrdtError> {
        if data.is_empty() {
            return Ok(false);
        }
        let before = self.observe();
        self.buffer.import(data)?;
        let after = self.observe();
        if before == after {
            return Ok(false);
        }

        let text_changed = before.text != after.text;
        if text_changed {
            self.emit(ChangeOrigin::Remote, ReplicaChange::Text);
        }
        if before.language != after.language {
            if let Some(language) = after.language {
                self.emit(ChangeOrigin::Remote, ReplicaChange::Language(language));
            }
        }
        if before.execution != after.execution {
            if let Some(execution) = after.execution {
                self.emit(ChangeOrigin::Remote, ReplicaChange::Execution(execution));
            }
        }
        Ok(text_changed)
    }

    /// Seed an empty shared buffer once, after the first completed sync.
    ///
    /// Returns true if the seed was inserted. Two replicas completing their
    /// first sync against an empty relay at the same moment can both insert.
    pub fn hydrate_once(&mut self, seed: &str) -> Result<bool, CrdtError> {
        if self.hydrated {
            return Ok(false);
        }
        self.hydrated = true;
        if !self.is_empty() || seed.is_empty() {
            return Ok(false);
        }
        tracing::debug!(chars = seed.chars().count(), "hydrating empty replica from seed");
        self.apply_local_insert(0, seed)?;
        Ok(true)
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn language(&self) -> Option<Language> {
        read_string(&self.session, LANGUAGE_KEY).map(Language::new)
    }

    /// Set the shared language tag. Returns false if it was already set.
    pub fn set_language(
        &mut self,
        language: &Language,
        origin: ChangeOrigin,
    ) -> Result<bool, CrdtError> {
        if self.language().as_ref() == Some(language) {
            return Ok(false);
        }
        self.session.insert(LANGUAGE_KEY, language.as_str())?;
        self.commit(origin, ReplicaChange::Language(language.clone()));
        Ok(true)
    }

    pub(crate) fn execution(&self) -> Option<SharedExecution> {
        let raw = read_string(&self.execution, LATEST_RESULT_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(execution) => Some(execution),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed execution slot");
                None
            }
        }
    }

    pub(crate) fn set_execution(&mut self, execution: &SharedExecution) -> Result<(), CrdtError> {
        let encoded = serde_json::to_string(execution)?;
        self.execution.insert(LATEST_RESULT_KEY, encoded)?;
        self.commit(
            ChangeOrigin::Local,
            ReplicaChange::Execution(execution.clone()),
        );
        Ok(())
    }

    pub fn version(&self) -> VersionVector {
        self.buffer.version()
    }

    /// Drain local updates not yet handed to the transport, oldest first.
    pub fn take_pending(&mut self) -> Vec<Vec<u8>> {
        let mut pending = Vec::new();
        while let Ok(update) = self.local_updates.try_recv() {
            pending.push(update);
        }
        pending
    }

    /// Ask the other side for everything beyond our version.
    pub fn sync_request(&self) -> SyncMessage {
        SyncMessage::SyncRequest {
            have_version: self.version().encode(),
        }
    }

    /// Answer a sync request with what the requester is missing.
    pub fn respond_to_sync(&self, have_version: &[u8]) -> Result<SyncMessage, CrdtError> {
        let have = decode_version(have_version)?;
        let data = self.buffer.export_updates_since(&have)?.unwrap_or_default();
        Ok(SyncMessage::SyncResponse {
            data,
            version: self.version().encode(),
        })
    }

    /// Merge a sync response and work out what the other side still lacks.
    ///
    /// Queued local updates are dropped here: everything the relay is
    /// missing, queued or not, is in the returned backfill.
    pub fn handle_sync_response(
        &mut self,
        data: &[u8],
        version: &[u8],
    ) -> Result<Option<Vec<u8>>, CrdtError> {
        self.apply_remote(data)?;
        let theirs = decode_version(version)?;
        let dropped = self.take_pending().len();
        let backfill = self.buffer.export_updates_since(&theirs)?;
        tracing::debug!(
            dropped,
            backfill = backfill.as_ref().map(Vec::len).unwrap_or(0),
            "sync response merged"
        );
        Ok(backfill)
    }

    fn commit(&mut self, origin: ChangeOrigin, change: ReplicaChange) {
        self.buffer.doc().commit();
        self.emit(origin, change);
    }

    fn emit(&self, origin: ChangeOrigin, change: ReplicaChange) {
        let event = ReplicaEvent { origin, change };
        tracing::trace!(origin = origin.as_str(), change = ?event.change, "replica changed");
        for listener in &self.listeners {
            listener(&event);
        }
    }

    fn observe(&self) -> Observed {
        Observed {
            text: self.current_text(),
            language: self.language(),
            execution: self.execution(),
        }
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("buffer", &self.buffer)
            .field("hydrated", &self.hydrated)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn decode_version(bytes: &[u8]) -> Result<VersionVector, CrdtError> {
    VersionVector::decode(bytes).map_err(|e| CrdtError::Version(e.to_string()))
}

fn read_string(map: &LoroMap, key: &str) -> Option<String> {
    match map.get(key)? {
        ValueOrContainer::Value(LoroValue::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
