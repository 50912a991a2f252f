//! Diff-to-edit translation.
//!
//! [`translate`] turns a foreign full-text value into the positional edits
//! that take the current text there, so a live editor keeps its cursor,
//! selection and undo history instead of having its buffer replaced.

use std::ops::Range;
use std::time::Duration;

use similar::{Algorithm, ChangeTag, TextDiff};
use smol_str::SmolStr;

use crate::text::TextBuffer;
use crate::types::{Affinity, EditBatch, Position, TextEdit, TextRange};

/// Upper bound on diff time. Past it the diff is coarser but still exact.
const DIFF_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors applying an edit batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("edit {index} starts at {position}, outside the buffer")]
    OutOfBounds { index: usize, position: Position },

    #[error("edit {index} ends before it starts")]
    InvertedRange { index: usize },

    #[error("edit {index} starts before the previous edit")]
    Unordered { index: usize },
}

/// Compute the edits that turn `current` into `target`.
///
/// Walks a char-level Myers diff left to right with a cursor in `current`'s
/// coordinates: equal spans advance the cursor, deleted spans emit a deletion
/// and advance, inserted spans emit a zero-width insertion without advancing.
/// Where a span is both deleted and inserted the deletion comes first.
pub fn translate(current: &str, target: &str) -> EditBatch {
    let mut batch = EditBatch::new();
    if current == target {
        return batch;
    }

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_TIMEOUT)
        .diff_chars(current, target);

    let mut cursor = Position::ZERO;
    let mut run: Option<(ChangeTag, String)> = None;
    for change in diff.iter_all_changes() {
        let tag = change.tag();
        if let Some((run_tag, text)) = run.as_mut() {
            if *run_tag == tag {
                text.push_str(change.value());
                continue;
            }
        }
        if let Some((run_tag, text)) = run.take() {
            flush(&mut batch, &mut cursor, run_tag, &text);
        }
        run = Some((tag, change.value().to_string()));
    }
    if let Some((run_tag, text)) = run {
        flush(&mut batch, &mut cursor, run_tag, &text);
    }

    batch
}

fn flush(batch: &mut EditBatch, cursor: &mut Position, tag: ChangeTag, text: &str) {
    match tag {
        ChangeTag::Equal => *cursor = cursor.advance(text),
        ChangeTag::Delete => {
            let end = cursor.advance(text);
            batch.push(TextEdit::delete(TextRange::new(*cursor, end)));
            *cursor = end;
        }
        ChangeTag::Insert => batch.push(TextEdit::insert(*cursor, text)),
    }
}

/// An edit with its positions resolved to char offsets in the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEdit {
    pub range: Range<usize>,
    pub text: SmolStr,
}

/// Resolve every edit against the buffer before anything is applied.
pub fn resolve<B: TextBuffer + ?Sized>(
    buffer: &B,
    batch: &EditBatch,
) -> Result<Vec<ResolvedEdit>, EditError> {
    let mut resolved = Vec::with_capacity(batch.len());
    let mut previous_start = 0;
    for (index, edit) in batch.iter().enumerate() {
        let start = buffer
            .position_to_char(edit.range.start)
            .ok_or(EditError::OutOfBounds {
                index,
                position: edit.range.start,
            })?;
        let end = buffer
            .position_to_char(edit.range.end)
            .ok_or(EditError::OutOfBounds {
                index,
                position: edit.range.end,
            })?;
        if end < start {
            return Err(EditError::InvertedRange { index });
        }
        if start < previous_start {
            return Err(EditError::Unordered { index });
        }
        previous_start = start;
        resolved.push(ResolvedEdit {
            range: start..end,
            text: edit.text.clone(),
        });
    }
    Ok(resolved)
}

/// Apply a batch as one unit against the buffer's current contents.
///
/// Edits are applied back to front so earlier offsets stay valid. Nothing is
/// applied if any edit fails to resolve.
pub fn apply_edits<B: TextBuffer + ?Sized>(
    buffer: &mut B,
    batch: &EditBatch,
) -> Result<Vec<ResolvedEdit>, EditError> {
    let resolved = resolve(buffer, batch)?;
    for edit in resolved.iter().rev() {
        if !edit.range.is_empty() {
            buffer.delete(edit.range.clone());
        }
        if !edit.text.is_empty() {
            buffer.insert(edit.range.start, &edit.text);
        }
    }
    Ok(resolved)
}

/// Where `offset` ends up after the resolved edits are applied.
///
/// An offset inside a deleted range collapses to the range start. Text
/// inserted exactly at the offset moves it only with [`Affinity::After`].
pub fn map_offset(offset: usize, edits: &[ResolvedEdit], affinity: Affinity) -> usize {
    let mut shift: isize = 0;
    for edit in edits {
        let (start, end) = (edit.range.start, edit.range.end);
        if start > offset {
            break;
        }
        shift -= (end.min(offset) - start) as isize;

        // Replacement text lands at `start`. It stays behind the offset when
        // the whole replaced range was behind it.
        let inserted = edit.text.chars().count() as isize;
        let behind = start < offset && end <= offset;
        if behind || affinity == Affinity::After {
            shift += inserted;
        }
    }
    offset.saturating_add_signed(shift)
}
