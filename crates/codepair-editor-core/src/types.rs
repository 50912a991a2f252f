//! Core editor types: positions, ranges, positional edits and selections.
//!
//! Positions are zero-based. Columns count chars (Unicode scalar values) from
//! the start of the line; only `\n` breaks lines.

use std::fmt;
use std::ops::Range;

use smol_str::SmolStr;
use web_time::Instant;

/// A (line, column) location in a text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const ZERO: Position = Position { line: 0, column: 0 };

    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Move past `text`, as a cursor would after typing it.
    pub fn advance(self, text: &str) -> Self {
        self.advance_chars(text.chars())
    }

    pub fn advance_chars(mut self, chars: impl IntoIterator<Item = char>) -> Self {
        for c in chars {
            if c == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
        }
        self
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Half-open range between two positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TextRange {
    pub start: Position,
    pub end: Position,
}

impl TextRange {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Zero-width range at `at`.
    pub fn empty(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Replace `range` with `text`.
///
/// A pure insertion has an empty range; a pure deletion has empty text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEdit {
    pub range: TextRange,
    pub text: SmolStr,
}

impl TextEdit {
    pub fn insert(at: Position, text: impl Into<SmolStr>) -> Self {
        Self {
            range: TextRange::empty(at),
            text: text.into(),
        }
    }

    pub fn delete(range: TextRange) -> Self {
        Self {
            range,
            text: SmolStr::default(),
        }
    }

    pub fn is_insert(&self) -> bool {
        self.range.is_empty() && !self.text.is_empty()
    }

    pub fn is_delete(&self) -> bool {
        !self.range.is_empty() && self.text.is_empty()
    }
}

/// An ordered batch of edits, all expressed against the same original text.
///
/// Edits are sorted by start position. Apply them as one unit, never
/// re-resolving positions between edits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EditBatch {
    pub edits: Vec<TextEdit>,
}

impl EditBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, edit: TextEdit) {
        self.edits.push(edit);
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextEdit> {
        self.edits.iter()
    }

    /// True if a single edit spans the whole of `original`.
    pub fn is_full_replace(&self, original: &str) -> bool {
        match self.edits.as_slice() {
            [edit] => {
                edit.range.start == Position::ZERO
                    && edit.range.end == Position::ZERO.advance(original)
                    && !original.is_empty()
            }
            _ => false,
        }
    }
}

impl IntoIterator for EditBatch {
    type Item = TextEdit;
    type IntoIter = std::vec::IntoIter<TextEdit>;

    fn into_iter(self) -> Self::IntoIter {
        self.edits.into_iter()
    }
}

/// Where a document change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// The local user typed it
    Local,
    /// Imported from a peer via the sync transport
    Remote,
    /// Applied by the session reconciler from a service snapshot
    Reconciled,
}

impl ChangeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOrigin::Local => "local",
            ChangeOrigin::Remote => "remote",
            ChangeOrigin::Reconciled => "reconciled",
        }
    }
}

/// Cursor affinity for edits landing exactly on the cursor.
///
/// `Before` keeps the cursor in front of text inserted at its position,
/// `After` pushes it past the insertion.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    #[default]
    Before,
    After,
}

/// Text selection with anchor and head positions, as char offsets.
///
/// The anchor is where the selection started, the head is where the cursor is now.
/// They may be in any order - use `start()` and `end()` for ordered bounds.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    /// Where selection started
    pub anchor: usize,
    /// Where cursor is now
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    /// Create a collapsed selection (cursor position).
    pub fn collapsed(offset: usize) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

    pub fn len(&self) -> usize {
        self.end() - self.start()
    }

    pub fn is_empty(&self) -> bool {
        self.is_collapsed()
    }

    /// Convert to a Range<usize> (ordered).
    pub fn to_range(&self) -> Range<usize> {
        self.start()..self.end()
    }

    pub fn is_backwards(&self) -> bool {
        self.head < self.anchor
    }
}

/// Information about the most recent edit to a buffer.
#[derive(Clone, Copy, Debug)]
pub struct EditInfo {
    /// Character offset where the edit occurred
    pub edit_char_pos: usize,
    /// Number of characters inserted
    pub inserted_len: usize,
    /// Number of characters deleted
    pub deleted_len: usize,
    /// Whether the edit contains a newline
    pub contains_newline: bool,
    /// Document length (in chars) after this edit was applied.
    pub doc_len_after: usize,
    /// When this edit occurred.
    pub timestamp: Instant,
}

impl PartialEq for EditInfo {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not meaningful for equality.
        self.edit_char_pos == other.edit_char_pos
            && self.inserted_len == other.inserted_len
            && self.deleted_len == other.deleted_len
            && self.contains_newline == other.contains_newline
            && self.doc_len_after == other.doc_len_after
    }
}

impl EditInfo {
    /// Check if this edit info is stale (doc has changed since this edit).
    pub fn is_stale(&self, current_doc_len: usize) -> bool {
        self.doc_len_after != current_doc_len
    }

    /// For insertions the inserted range; for deletions an empty range at the
    /// deletion point.
    pub fn affected_range(&self) -> Range<usize> {
        self.edit_char_pos..self.edit_char_pos + self.inserted_len
    }
}
