//! Session reconciler.
//!
//! Snapshots pushed by the session service arrive out of band and can lag
//! the replica stream. The reconciler decides, per snapshot, whether its text
//! may touch the replica:
//!
//! 1. a snapshot whose revision is not newer than the last one seen is stale
//! 2. if we wrote it (`last_modified_by` is us) our text stands
//! 3. a snapshot whose text matches the last one adopted only carries
//!    metadata (typing, roster, language) and must not touch the text
//! 4. before the first sync completes the text becomes the hydration seed,
//!    and is held until the sync completes
//! 5. if the author is online their edits are already arriving on the
//!    replica stream, and applying the snapshot would race them
//! 6. only one online participant applies a foreign snapshot, so the same
//!    text isn't inserted once per replica
//!
//! Everything else (language, roster, creation time) is always adopted.

use std::collections::BTreeSet;

use codepair_common::{Language, ParticipantId, Session};
use codepair_editor_core::{ChangeOrigin, EditBatch, translate};

use crate::error::CrdtError;
use crate::replica::Replica;

/// Why a snapshot's text was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// No completed sync yet. The text was kept as the hydration seed.
    Unsynced,
    /// The author is connected; their operations will carry the text.
    AuthorOnline,
    /// Another online participant is responsible for applying it.
    PeerApplies,
}

/// What reconciling one snapshot did to the replica text.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Older than a snapshot already handled. Nothing adopted.
    Stale,
    /// We were the last writer, so the local text was kept.
    KeptLocal,
    Deferred(DeferReason),
    /// The replica already held the snapshot's text.
    Unchanged,
    /// The text matched the last adopted snapshot; only metadata was taken.
    MetadataOnly,
    /// The replica was moved to the snapshot's text with this batch.
    Applied(EditBatch),
}

/// Connection facts the policy depends on.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaContext<'a> {
    /// A sync with the relay has completed on the current connection.
    pub synced: bool,
    /// Participants currently present on the sync connection, us included.
    pub online: &'a BTreeSet<ParticipantId>,
}

/// Tunables for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Hold back text from authors who are online.
    pub defer_to_live_author: bool,
    /// Let only the lowest online participant id apply foreign text.
    pub single_applier: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            defer_to_live_author: true,
            single_applier: true,
        }
    }
}

/// Merges session snapshots with the live replica for one participant.
#[derive(Debug)]
pub struct SessionReconciler {
    local_participant: ParticipantId,
    policy: ReconcilePolicy,
    last_revision: Option<u64>,
    session: Option<Session>,
    seed: Option<String>,
    /// Text of the last adopted snapshot.
    last_code: Option<String>,
    /// Foreign snapshot that arrived before the sync completed.
    pending: Option<Session>,
}

impl SessionReconciler {
    pub fn new(local_participant: impl Into<ParticipantId>) -> Self {
        Self::with_policy(local_participant, ReconcilePolicy::default())
    }

    pub fn with_policy(local_participant: impl Into<ParticipantId>, policy: ReconcilePolicy) -> Self {
        Self {
            local_participant: local_participant.into(),
            policy,
            last_revision: None,
            session: None,
            seed: None,
            last_code: None,
            pending: None,
        }
    }

    /// The adopted session metadata. Its `code` is whatever the last adopted
    /// snapshot carried and may trail the replica.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Text to hydrate an empty replica with after the first sync.
    pub fn seed(&self) -> Option<&str> {
        self.seed.as_deref()
    }

    /// Reconcile one snapshot into the replica.
    pub fn reconcile(
        &mut self,
        snapshot: &Session,
        replica: &mut Replica,
        context: ReplicaContext<'_>,
    ) -> Result<Reconciled, CrdtError> {
        // Revision 0 comes from services that don't track revisions.
        if snapshot.revision != 0
            && self
                .last_revision
                .is_some_and(|seen| snapshot.revision <= seen)
        {
            tracing::trace!(
                revision = snapshot.revision,
                last = ?self.last_revision,
                "ignoring stale session snapshot"
            );
            return Ok(Reconciled::Stale);
        }
        self.last_revision = Some(snapshot.revision);
        self.session = Some(snapshot.clone());

        let outcome = self.reconcile_text(snapshot, replica, context)?;
        tracing::debug!(
            session = %snapshot.id,
            revision = snapshot.revision,
            author = ?snapshot.last_modified_by,
            ?outcome,
            "reconciled session snapshot"
        );
        Ok(outcome)
    }

    /// Reconcile the foreign snapshot held back while unsynced.
    ///
    /// Called once the sync completes and the replica holds the shared
    /// document. Returns `None` if nothing was held.
    pub fn reconcile_pending(
        &mut self,
        replica: &mut Replica,
        context: ReplicaContext<'_>,
    ) -> Result<Option<Reconciled>, CrdtError> {
        let Some(snapshot) = self.pending.take() else {
            return Ok(None);
        };
        let outcome = self.reconcile_foreign(&snapshot, replica, context)?;
        tracing::debug!(
            session = %snapshot.id,
            revision = snapshot.revision,
            ?outcome,
            "reconciled held snapshot after sync"
        );
        Ok(Some(outcome))
    }

    /// Drop the held snapshot. Used when another replica seeds the document.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Adopt the snapshot's language into the replica if it differs.
    ///
    /// Returns the language when it changed.
    pub fn adopt_language(
        &self,
        replica: &mut Replica,
    ) -> Result<Option<Language>, CrdtError> {
        let Some(session) = &self.session else {
            return Ok(None);
        };
        if replica.set_language(&session.language, ChangeOrigin::Reconciled)? {
            Ok(Some(session.language.clone()))
        } else {
            Ok(None)
        }
    }

    fn reconcile_text(
        &mut self,
        snapshot: &Session,
        replica: &mut Replica,
        context: ReplicaContext<'_>,
    ) -> Result<Reconciled, CrdtError> {
        let moved = self.last_code.as_deref() != Some(snapshot.code.as_str());
        if moved {
            self.last_code = Some(snapshot.code.clone());
            if !context.synced {
                self.seed = Some(snapshot.code.clone());
            }
        }

        if snapshot.last_modified_by.as_ref() == Some(&self.local_participant) {
            self.pending = None;
            return Ok(Reconciled::KeptLocal);
        }
        if !moved {
            return Ok(Reconciled::MetadataOnly);
        }

        if !context.synced {
            self.pending = Some(snapshot.clone());
            return Ok(Reconciled::Deferred(DeferReason::Unsynced));
        }
        self.pending = None;
        self.reconcile_foreign(snapshot, replica, context)
    }

    fn reconcile_foreign(
        &self,
        snapshot: &Session,
        replica: &mut Replica,
        context: ReplicaContext<'_>,
    ) -> Result<Reconciled, CrdtError> {
        let author = snapshot.last_modified_by.as_ref();
        if self.policy.defer_to_live_author
            && author.is_some_and(|id| context.online.contains(id))
        {
            return Ok(Reconciled::Deferred(DeferReason::AuthorOnline));
        }

        if self.policy.single_applier && !self.is_applier(context.online) {
            return Ok(Reconciled::Deferred(DeferReason::PeerApplies));
        }

        let batch = translate(&replica.current_text(), &snapshot.code);
        if batch.is_empty() {
            return Ok(Reconciled::Unchanged);
        }
        replica.apply_batch(&batch, ChangeOrigin::Reconciled)?;
        Ok(Reconciled::Applied(batch))
    }

    fn is_applier(&self, online: &BTreeSet<ParticipantId>) -> bool {
        match online.first() {
            Some(lowest) => *lowest >= self.local_participant,
            None => true,
        }
    }
}
