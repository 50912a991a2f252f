//! Session client: one participant's view of a collaborative session.
//!
//! A [`SessionClient`] owns the replica and drives everything around it from
//! a single task. Transport events, service snapshots and the typing deadline
//! are handled one at a time by [`SessionClient::step`]; local edits come in
//! through the edit methods. Nothing here returns a connectivity error:
//! those show up in [`CoordinatorState`].

use std::collections::BTreeSet;

use codepair_common::execute::ExecutionSandbox;
use codepair_common::service::{JoinResponse, SessionService};
use codepair_common::transport::{
    ConnectionPool, PresenceState, SessionEvent, SessionSubscription, SyncMessage,
};
use codepair_common::{ClientConfig, Language, Participant, ParticipantId, Session, SessionId};
use codepair_editor_core::{
    ChangeOrigin, EditorSurface, MemorySurface, TypingDebouncer, TypingTransition, translate,
};
use n0_future::StreamExt;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::CrdtError;
use crate::execution::{ExecutionChannel, SharedExecution};
use crate::reconciler::{Reconciled, ReplicaContext, SessionReconciler};
use crate::replica::Replica;

/// Lifecycle of a session client.
///
/// UI can use this to show a connection indicator.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CoordinatorState {
    /// Joined; waiting for the first connection.
    #[default]
    Connecting,
    /// Connected; waiting for the relay's sync response.
    Syncing,
    /// Synced and exchanging live updates.
    Active,
    /// Connection lost. Edits are queued until the next sync.
    Offline { reason: SmolStr },
    /// Left the session.
    Left,
}

impl CoordinatorState {
    /// Returns true if the client is synced with the relay.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns the disconnect reason if offline.
    pub fn offline_reason(&self) -> Option<&str> {
        match self {
            Self::Offline { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Aborts the snapshot forwarder when the client goes away.
struct ForwarderGuard(AbortHandle);

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Collaborative session client for one participant.
pub struct SessionClient<S: SessionService, E: EditorSurface = MemorySurface> {
    service: S,
    participant: Participant,
    session_id: SessionId,
    subscription: SessionSubscription,
    replica: Replica,
    surface: E,
    language_mode: Option<Language>,
    reconciler: SessionReconciler,
    typing: TypingDebouncer,
    snapshots: mpsc::UnboundedReceiver<Session>,
    _forwarder: ForwarderGuard,
    state: CoordinatorState,
    persist_text: bool,
    last_persisted: Option<String>,
    dirty: bool,
}

impl<S: SessionService, E: EditorSurface> SessionClient<S, E> {
    /// Join a session and connect to its relay.
    ///
    /// Validation errors from the service (taken username, unknown session)
    /// come back here. The connection itself is established in the
    /// background; drive the client with [`step`](Self::step).
    pub async fn join(
        service: S,
        pool: &ConnectionPool,
        session_id: &str,
        username: &str,
        surface: E,
        config: &ClientConfig,
    ) -> Result<Self, CrdtError> {
        let JoinResponse { user, session } = service.join_session(session_id, username).await?;
        tracing::info!(session = %session_id, participant = %user.id, username = %user.username, "joined session");

        let (tx, snapshots) = mpsc::unbounded_channel();
        let mut updates = service.subscribe(session_id);
        let forwarder = tokio::spawn(async move {
            while let Some(snapshot) = updates.next().await {
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
        });

        let subscription = pool.connect(session_id);
        subscription.set_presence(PresenceState::from_participant(&user));

        let mut client = Self {
            service,
            reconciler: SessionReconciler::new(user.id.clone()),
            participant: user,
            session_id: session.id.clone(),
            subscription,
            replica: Replica::new(),
            surface,
            language_mode: None,
            typing: TypingDebouncer::new(config.typing_quiet_period),
            snapshots,
            _forwarder: ForwarderGuard(forwarder.abort_handle()),
            state: CoordinatorState::Connecting,
            persist_text: config.persist_text,
            last_persisted: None,
            dirty: false,
        };
        client.handle_snapshot(session).await;
        Ok(client)
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Mutable access to the replica, for registering change callbacks.
    pub fn replica_mut(&mut self) -> &mut Replica {
        &mut self.replica
    }

    pub fn surface(&self) -> &E {
        &self.surface
    }

    pub fn text(&self) -> String {
        self.replica.current_text()
    }

    /// Last adopted session metadata (roster, creation time).
    pub fn session(&self) -> Option<&Session> {
        self.reconciler.session()
    }

    /// Language from the shared document, else the last snapshot.
    pub fn language(&self) -> Language {
        self.replica
            .language()
            .or_else(|| self.reconciler.session().map(|s| s.language.clone()))
            .unwrap_or_default()
    }

    /// Participants currently connected to the relay.
    pub fn online(&self) -> Vec<PresenceState> {
        self.subscription.online().borrow().clone()
    }

    pub fn online_ids(&self) -> BTreeSet<ParticipantId> {
        self.subscription.online_ids()
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_typing()
    }

    pub fn latest_result(&self) -> Option<SharedExecution> {
        self.replica.latest_result()
    }

    /// Wait for and handle one event. Returns false once the connection is
    /// gone for good.
    pub async fn step(&mut self) -> bool {
        let deadline = self.typing.deadline().map(tokio::time::Instant::from_std);
        tokio::select! {
            event = self.subscription.next_event() => match event {
                Some(event) => self.handle_event(event).await,
                None => return false,
            },
            Some(snapshot) = self.snapshots.recv() => self.handle_snapshot(snapshot).await,
            _ = sleep_until(deadline) => self.poll_typing().await,
        }
        true
    }

    /// Handle every event that is already waiting, without blocking.
    pub async fn pump(&mut self) {
        loop {
            if let Some(event) = self.subscription.try_next_event() {
                self.handle_event(event).await;
            } else if let Ok(snapshot) = self.snapshots.try_recv() {
                self.handle_snapshot(snapshot).await;
            } else {
                break;
            }
        }
        self.poll_typing().await;
    }

    /// Record an insertion the user already made on the surface.
    pub async fn local_insert(&mut self, pos: usize, text: &str) -> Result<(), CrdtError> {
        self.replica.apply_local_insert(pos, text)?;
        self.after_local_edit().await;
        Ok(())
    }

    /// Record a deletion the user already made on the surface.
    pub async fn local_delete(&mut self, pos: usize, len: usize) -> Result<(), CrdtError> {
        self.replica.apply_local_delete(pos, len)?;
        self.after_local_edit().await;
        Ok(())
    }

    pub async fn focus(&mut self) {
        if let Some(transition) = self.typing.focus(clock()) {
            self.announce_typing(transition).await;
        }
    }

    pub async fn blur(&mut self) {
        if let Some(transition) = self.typing.blur() {
            self.announce_typing(transition).await;
        }
    }

    /// Change the session language for everyone.
    pub async fn set_language(&mut self, language: Language) -> Result<(), CrdtError> {
        if self.replica.set_language(&language, ChangeOrigin::Local)? {
            self.flush();
        }
        self.mirror_language();
        self.service
            .update_language(&self.session_id, &language)
            .await?;
        Ok(())
    }

    /// Run the current text and share the result with the session.
    pub async fn run(
        &mut self,
        sandbox: &impl ExecutionSandbox,
    ) -> Result<SharedExecution, CrdtError> {
        let language = self.language();
        let result = sandbox
            .execute(&self.replica.current_text(), &language)
            .await;
        let shared = self
            .replica
            .publish(result, self.participant.username.as_str())?;
        self.flush();
        Ok(shared)
    }

    /// Leave the session: presence is withdrawn, the roster entry removed.
    pub async fn leave(mut self) -> Result<(), CrdtError> {
        self.flush();
        self.subscription.leave();
        self.state = CoordinatorState::Left;
        self.service
            .leave_session(&self.session_id, &self.participant.id)
            .await?;
        tracing::info!(session = %self.session_id, participant = %self.participant.id, "left session");
        Ok(())
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                tracing::debug!(session = %self.session_id, "connected, requesting sync");
                self.state = CoordinatorState::Syncing;
                if let Err(e) = self.subscription.send(self.replica.sync_request()) {
                    tracing::debug!(error = %e, "sync request not sent");
                }
            }
            SessionEvent::Disconnected { reason } => {
                tracing::info!(session = %self.session_id, %reason, "offline, queueing edits");
                self.state = CoordinatorState::Offline { reason };
            }
            SessionEvent::Message(SyncMessage::SyncResponse { data, version }) => {
                self.on_synced(&data, &version).await;
            }
            SessionEvent::Message(SyncMessage::Update { data }) => {
                match self.replica.apply_remote(&data) {
                    Ok(_) => self.mirror(),
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable update"),
                }
            }
            SessionEvent::Message(other) => {
                tracing::trace!(kind = other.kind(), "ignoring relay message");
            }
            SessionEvent::PresenceChanged(peers) => {
                tracing::debug!(session = %self.session_id, online = peers.len(), "presence changed");
            }
        }
    }

    async fn on_synced(&mut self, data: &[u8], version: &[u8]) {
        match self.replica.handle_sync_response(data, version) {
            Ok(Some(backfill)) => {
                if let Err(e) = self
                    .subscription
                    .send(SyncMessage::Update { data: backfill })
                {
                    tracing::debug!(error = %e, "backfill not sent");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "sync response rejected");
                return;
            }
        }
        self.state = CoordinatorState::Active;

        // A sibling on the same connection seeds the document; its update
        // arrives as an echo.
        let sibling_seeds = self.replica.is_empty()
            && !self.replica.is_hydrated()
            && !self.subscription.claim_hydration();
        let seed = if sibling_seeds {
            self.reconciler.discard_pending();
            String::new()
        } else {
            self.reconciler.seed().unwrap_or_default().to_owned()
        };
        match self.replica.hydrate_once(&seed) {
            Ok(true) => self.last_persisted = Some(seed),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "hydration failed"),
        }

        let online = self.online_ids();
        let context = ReplicaContext {
            synced: true,
            online: &online,
        };
        if let Err(e) = self.reconciler.reconcile_pending(&mut self.replica, context) {
            tracing::warn!(error = %e, "held snapshot reconciliation failed");
        }
        if self.replica.language().is_none() {
            if let Err(e) = self.reconciler.adopt_language(&mut self.replica) {
                tracing::warn!(error = %e, "could not adopt session language");
            }
        }

        self.mirror();
        self.flush();
        if self.dirty {
            self.persist().await;
        }
    }

    async fn handle_snapshot(&mut self, snapshot: Session) {
        let online = self.online_ids();
        let context = ReplicaContext {
            synced: self.state.is_active(),
            online: &online,
        };
        match self.reconciler.reconcile(&snapshot, &mut self.replica, context) {
            Ok(Reconciled::Stale) => return,
            Ok(Reconciled::Applied(_)) => {
                self.mirror();
                self.flush();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "snapshot reconciliation failed"),
        }

        if self.state.is_active() {
            match self.reconciler.adopt_language(&mut self.replica) {
                Ok(Some(_)) => self.flush(),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "could not adopt session language"),
            }
        }
        self.mirror_language();
    }

    async fn after_local_edit(&mut self) {
        self.dirty = true;
        if let Some(transition) = self.typing.keystroke(clock()) {
            self.announce_typing(transition).await;
        }
        self.flush();
        self.persist().await;
    }

    async fn poll_typing(&mut self) {
        if let Some(transition) = self.typing.poll(clock()) {
            self.announce_typing(transition).await;
        }
    }

    async fn announce_typing(&mut self, transition: TypingTransition) {
        let typing = transition.is_typing();
        tracing::trace!(participant = %self.participant.id, typing, "typing transition");
        self.participant.is_typing = typing;
        self.subscription
            .set_presence(PresenceState::from_participant(&self.participant));
        if let Err(e) = self
            .service
            .set_typing(&self.session_id, &self.participant.id, typing)
            .await
        {
            tracing::warn!(error = %e, "failed to record typing state");
        }
    }

    /// Hand queued local updates to the transport once synced.
    fn flush(&mut self) {
        if !self.state.is_active() {
            return;
        }
        for data in self.replica.take_pending() {
            // The next sync backfills anything lost here.
            if let Err(e) = self.subscription.send(SyncMessage::Update { data }) {
                tracing::debug!(error = %e, "update not sent");
                break;
            }
        }
    }

    /// Save local text to the session service.
    async fn persist(&mut self) {
        if !self.persist_text || !self.state.is_active() {
            return;
        }
        let text = self.replica.current_text();
        if self.last_persisted.as_deref() == Some(text.as_str()) {
            self.dirty = false;
            return;
        }
        match self
            .service
            .update_code(&self.session_id, &text, &self.participant.id)
            .await
        {
            Ok(()) => {
                self.last_persisted = Some(text);
                self.dirty = false;
            }
            Err(e) => tracing::warn!(error = %e, "failed to persist session text"),
        }
    }

    /// Bring the surface to the replica's text with positional edits.
    fn mirror(&mut self) {
        let batch = translate(&self.surface.text(), &self.replica.current_text());
        if !batch.is_empty() {
            if let Err(e) = self.surface.apply_edits(&batch) {
                tracing::warn!(error = %e, "surface rejected edit batch");
            }
        }
        self.mirror_language();
    }

    fn mirror_language(&mut self) {
        let language = self.language();
        if self.language_mode.as_ref() != Some(&language) {
            self.surface.set_language_mode(language.as_str());
            self.language_mode = Some(language);
        }
    }
}

impl<S: SessionService> SessionClient<S, MemorySurface> {
    /// Type at the surface cursor, replacing any selection.
    pub async fn type_text(&mut self, text: &str) -> Result<(), CrdtError> {
        let (start, removed) = self.surface.type_text(text);
        if removed > 0 {
            self.replica.apply_local_delete(start, removed)?;
        }
        self.replica.apply_local_insert(start, text)?;
        self.after_local_edit().await;
        Ok(())
    }

    /// Delete the selection or the char before the cursor.
    pub async fn backspace(&mut self) -> Result<(), CrdtError> {
        if let Some((start, len)) = self.surface.backspace() {
            self.replica.apply_local_delete(start, len)?;
            self.after_local_edit().await;
        }
        Ok(())
    }

    pub fn surface_mut(&mut self) -> &mut MemorySurface {
        &mut self.surface
    }
}

// Typing deadlines come from the tokio clock so paused-time tests line up.
fn clock() -> web_time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_state_default() {
        assert_eq!(CoordinatorState::default(), CoordinatorState::Connecting);
    }

    #[test]
    fn test_coordinator_state_is_active() {
        assert!(!CoordinatorState::Syncing.is_active());
        assert!(CoordinatorState::Active.is_active());
    }

    #[test]
    fn test_offline_reason() {
        let state = CoordinatorState::Offline {
            reason: "connection reset".into(),
        };
        assert_eq!(state.offline_reason(), Some("connection reset"));
        assert_eq!(CoordinatorState::Left.offline_reason(), None);
    }
}
