//! Execution result channel.
//!
//! The last run's result lives in a single slot of the shared document. A
//! newer write replaces it everywhere; concurrent writes resolve the way Loro
//! resolves any map key, so every replica ends up showing the same result.

use codepair_common::ExecutionResult;
use codepair_common::session::now_millis;
use codepair_editor_core::ChangeOrigin;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::CrdtError;
use crate::replica::{Replica, ReplicaChange};

/// A result as broadcast to the session, with who ran it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedExecution {
    pub result: ExecutionResult,
    pub author: SmolStr,
    /// Unix timestamp (milliseconds) of publication.
    pub published_at: i64,
}

/// Publish and observe the shared execution result.
pub trait ExecutionChannel {
    /// Replace the shared result.
    fn publish(
        &mut self,
        result: ExecutionResult,
        author: &str,
    ) -> Result<SharedExecution, CrdtError>;

    /// The result currently in the slot.
    fn latest_result(&self) -> Option<SharedExecution>;

    /// Run `callback` for every result that lands in the slot, local or remote.
    fn on_result(&mut self, callback: impl Fn(&SharedExecution, ChangeOrigin) + Send + Sync + 'static);
}

impl ExecutionChannel for Replica {
    fn publish(
        &mut self,
        result: ExecutionResult,
        author: &str,
    ) -> Result<SharedExecution, CrdtError> {
        let shared = SharedExecution {
            result,
            author: author.into(),
            published_at: now_millis(),
        };
        self.set_execution(&shared)?;
        tracing::debug!(
            author,
            failed = shared.result.is_error(),
            duration_ms = shared.result.duration_ms,
            "published execution result"
        );
        Ok(shared)
    }

    fn latest_result(&self) -> Option<SharedExecution> {
        self.execution()
    }

    fn on_result(&mut self, callback: impl Fn(&SharedExecution, ChangeOrigin) + Send + Sync + 'static) {
        self.on_change(move |event| {
            if let ReplicaChange::Execution(shared) = &event.change {
                callback(shared, event.origin);
            }
        });
    }
}
