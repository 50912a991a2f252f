//! Editor surface seam.
//!
//! The visual editor is external; this trait is everything the sync layer
//! needs from it. [`MemorySurface`] is a headless implementation that keeps
//! a rope and a selection, used by tests and non-visual clients.

use smol_str::SmolStr;

use crate::diff::{EditError, apply_edits, map_offset};
use crate::text::{EditorRope, TextBuffer};
use crate::types::{Affinity, EditBatch, Selection};

/// What the sync layer needs from an editor.
pub trait EditorSurface {
    /// Current text as the user sees it.
    fn text(&self) -> String;

    /// Apply a positional batch as one unit, preserving cursor and selection.
    fn apply_edits(&mut self, batch: &EditBatch) -> Result<(), EditError>;

    /// Switch syntax mode for a language tag.
    fn set_language_mode(&mut self, language: &str);
}

/// Headless editor surface.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    buffer: EditorRope,
    selection: Selection,
    language: SmolStr,
    applied: Vec<EditBatch>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            buffer: EditorRope::from_str(text),
            ..Self::default()
        }
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Move the cursor or selection. Offsets are clamped to the text.
    pub fn set_selection(&mut self, selection: Selection) {
        let len = self.buffer.len_chars();
        self.selection = Selection::new(selection.anchor.min(len), selection.head.min(len));
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Every batch applied through [`EditorSurface::apply_edits`], in order.
    pub fn applied_batches(&self) -> &[EditBatch] {
        &self.applied
    }

    /// Type at the cursor, replacing any selection. Returns the char offset
    /// where the text went and how many chars were removed.
    pub fn type_text(&mut self, text: &str) -> (usize, usize) {
        let range = self.selection.to_range();
        let removed = range.len();
        self.buffer.replace(range.clone(), text);
        let cursor = range.start + text.chars().count();
        self.selection = Selection::collapsed(cursor);
        (range.start, removed)
    }

    /// Delete the selection, or the char before the cursor.
    /// Returns the removed range as (start, len).
    pub fn backspace(&mut self) -> Option<(usize, usize)> {
        let range = if self.selection.is_collapsed() {
            let head = self.selection.head;
            if head == 0 {
                return None;
            }
            head - 1..head
        } else {
            self.selection.to_range()
        };
        self.buffer.delete(range.clone());
        self.selection = Selection::collapsed(range.start);
        Some((range.start, range.len()))
    }
}

impl EditorSurface for MemorySurface {
    fn text(&self) -> String {
        self.buffer.to_string()
    }

    fn apply_edits(&mut self, batch: &EditBatch) -> Result<(), EditError> {
        if batch.is_empty() {
            return Ok(());
        }
        let resolved = apply_edits(&mut self.buffer, batch)?;
        self.selection = Selection::new(
            map_offset(self.selection.anchor, &resolved, Affinity::Before),
            map_offset(self.selection.head, &resolved, Affinity::Before),
        );
        self.applied.push(batch.clone());
        tracing::trace!(edits = batch.len(), "applied edit batch to surface");
        Ok(())
    }

    fn set_language_mode(&mut self, language: &str) {
        self.language = language.into();
    }
}
