//! CRDT-backed session replica and collaboration client.
//!
//! This crate provides:
//! - `LoroTextBuffer`: Loro-backed text buffer implementing `TextBuffer`
//! - `Replica`: the shared document (text, language, last run) with sync
//!   handshake and an outbound update queue
//! - `ExecutionChannel`: last-writer-wins execution result slot
//! - `SessionReconciler`: merges session service snapshots into the replica
//! - `SessionClient`: wires replica, transport, surface and typing together

mod buffer;
mod coordinator;
mod error;
mod execution;
mod reconciler;
mod replica;

pub use buffer::{CONTENT_CONTAINER, LoroTextBuffer};
pub use coordinator::{CoordinatorState, SessionClient};
pub use error::CrdtError;
pub use execution::{ExecutionChannel, SharedExecution};
pub use reconciler::{DeferReason, ReconcilePolicy, Reconciled, ReplicaContext, SessionReconciler};
pub use replica::{EXECUTION_CONTAINER, Replica, ReplicaChange, ReplicaEvent, SESSION_CONTAINER};

// Re-export Loro types that consumers need
pub use loro::{ExportMode, LoroDoc, LoroText, VersionVector};
