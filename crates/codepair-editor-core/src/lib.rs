//! codepair-editor-core: editor-side logic without framework or network
//! dependencies.
//!
//! This crate provides:
//! - `TextBuffer` trait for text storage abstraction
//! - `EditorRope` - ropey-backed implementation
//! - `translate` - diff-to-edit translation into positional edit batches
//! - `EditorSurface` - the seam to a visual editor, with a headless impl
//! - `TypingDebouncer` - focus/keystroke/blur to typing presence

pub mod diff;
pub mod surface;
pub mod text;
pub mod types;
pub mod typing;

pub use diff::{EditError, ResolvedEdit, apply_edits, map_offset, resolve, translate};
pub use smol_str::SmolStr;
pub use surface::{EditorSurface, MemorySurface};
pub use text::{EditorRope, TextBuffer};
pub use types::{
    Affinity, ChangeOrigin, EditBatch, EditInfo, Position, Selection, TextEdit, TextRange,
};
pub use typing::{DEFAULT_QUIET_PERIOD, TypingDebouncer, TypingTransition};
