//! Loro-backed text buffer implementing the core `TextBuffer` trait.

use std::borrow::Cow;
use std::ops::Range;

use codepair_editor_core::{EditInfo, TextBuffer};
use loro::{LoroDoc, LoroText, VersionVector, cursor::PosType};
use smol_str::{SmolStr, ToSmolStr};
use web_time::Instant;

use crate::CrdtError;

/// Name of the shared text container.
pub const CONTENT_CONTAINER: &str = "content";

/// Loro-backed text buffer.
///
/// Wraps a `LoroDoc` with a text container. Writes go to the doc's pending
/// transaction; callers commit when an edit (or a batch of them) is complete.
#[derive(Clone)]
pub struct LoroTextBuffer {
    doc: LoroDoc,
    content: LoroText,
    last_edit: Option<EditInfo>,
}

impl LoroTextBuffer {
    /// Create a new empty buffer.
    pub fn new() -> Self {
        Self::with_doc(LoroDoc::new())
    }

    /// Wrap an existing document, using its content container.
    pub fn with_doc(doc: LoroDoc) -> Self {
        let content = doc.get_text(CONTENT_CONTAINER);
        Self {
            doc,
            content,
            last_edit: None,
        }
    }

    /// Create a buffer from an existing Loro snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, CrdtError> {
        let doc = LoroDoc::new();
        doc.import(snapshot)
            .map_err(|e| CrdtError::Import(e.to_string()))?;
        Ok(Self::with_doc(doc))
    }

    /// Get the underlying Loro document.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    /// Get the text container.
    pub fn content(&self) -> &LoroText {
        &self.content
    }

    /// Export full snapshot.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        Ok(self.doc.export(loro::ExportMode::Snapshot)?)
    }

    /// Export updates since given version. None when there is nothing newer.
    pub fn export_updates_since(
        &self,
        version: &VersionVector,
    ) -> Result<Option<Vec<u8>>, CrdtError> {
        if *version == self.doc.oplog_vv() {
            return Ok(None);
        }

        let updates = self.doc.export(loro::ExportMode::Updates {
            from: Cow::Borrowed(version),
        })?;

        if updates.is_empty() {
            return Ok(None);
        }
        Ok(Some(updates))
    }

    /// Import remote changes. Already-seen operations are ignored by Loro.
    pub fn import(&mut self, data: &[u8]) -> Result<(), CrdtError> {
        self.doc
            .import(data)
            .map_err(|e| CrdtError::Import(e.to_string()))?;
        Ok(())
    }

    /// Get current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }
}

impl Default for LoroTextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoroTextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoroTextBuffer")
            .field("len_chars", &self.content.len_unicode())
            .field("peer", &self.doc.peer_id())
            .finish()
    }
}

impl TextBuffer for LoroTextBuffer {
    fn len_bytes(&self) -> usize {
        self.content.len_utf8()
    }

    fn len_chars(&self) -> usize {
        self.content.len_unicode()
    }

    fn insert(&mut self, char_offset: usize, text: &str) {
        if let Err(e) = self.content.insert(char_offset, text) {
            tracing::warn!(char_offset, error = %e, "loro insert rejected");
            return;
        }

        self.last_edit = Some(EditInfo {
            edit_char_pos: char_offset,
            inserted_len: text.chars().count(),
            deleted_len: 0,
            contains_newline: text.contains('\n'),
            doc_len_after: self.content.len_unicode(),
            timestamp: Instant::now(),
        });
    }

    fn delete(&mut self, char_range: Range<usize>) {
        let contains_newline = self
            .slice(char_range.clone())
            .map(|s| s.contains('\n'))
            .unwrap_or(false);
        let deleted_len = char_range.len();

        if let Err(e) = self.content.delete(char_range.start, deleted_len) {
            tracing::warn!(?char_range, error = %e, "loro delete rejected");
            return;
        }

        self.last_edit = Some(EditInfo {
            edit_char_pos: char_range.start,
            inserted_len: 0,
            deleted_len,
            contains_newline,
            doc_len_after: self.content.len_unicode(),
            timestamp: Instant::now(),
        });
    }

    fn slice(&self, char_range: Range<usize>) -> Option<SmolStr> {
        if char_range.end > self.content.len_unicode() || char_range.start > char_range.end {
            return None;
        }
        self.content
            .slice(char_range.start, char_range.end)
            .ok()
            .map(|s| s.to_smolstr())
    }

    fn char_at(&self, char_offset: usize) -> Option<char> {
        self.content.char_at(char_offset).ok()
    }

    fn to_string(&self) -> String {
        self.content.to_string()
    }

    fn char_to_byte(&self, char_offset: usize) -> usize {
        self.content
            .convert_pos(char_offset, PosType::Unicode, PosType::Bytes)
            .unwrap_or(self.content.len_utf8())
    }

    fn byte_to_char(&self, byte_offset: usize) -> usize {
        self.content
            .convert_pos(byte_offset, PosType::Bytes, PosType::Unicode)
            .unwrap_or(self.content.len_unicode())
    }

    fn last_edit(&self) -> Option<EditInfo> {
        self.last_edit
    }
}
