//! Text buffer abstraction for editor storage.
//!
//! The `TextBuffer` trait provides a common interface for text storage,
//! so edit batches can be applied to a plain rope (the editor surface) or to
//! the Loro-backed replica alike.

use smol_str::{SmolStr, ToSmolStr};
use std::ops::Range;
use web_time::Instant;

use crate::types::{EditInfo, Position};

/// A text buffer that supports efficient editing and offset conversion.
///
/// All offsets are in Unicode scalar values (chars), not bytes or UTF-16.
pub trait TextBuffer {
    /// Total length in bytes (UTF-8).
    fn len_bytes(&self) -> usize;

    /// Total length in chars (Unicode scalar values).
    fn len_chars(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len_chars() == 0
    }

    /// Insert text at char offset.
    fn insert(&mut self, char_offset: usize, text: &str);

    /// Append text at end.
    fn push(&mut self, text: &str) {
        self.insert(self.len_chars(), text);
    }

    /// Delete char range.
    fn delete(&mut self, char_range: Range<usize>);

    /// Replace char range with text.
    fn replace(&mut self, char_range: Range<usize>, text: &str) {
        self.delete(char_range.clone());
        self.insert(char_range.start, text);
    }

    /// Get a slice as SmolStr. Returns None if range is invalid.
    fn slice(&self, char_range: Range<usize>) -> Option<SmolStr>;

    /// Get character at offset. Returns None if out of bounds.
    fn char_at(&self, char_offset: usize) -> Option<char>;

    /// Convert entire buffer to String.
    fn to_string(&self) -> String;

    /// Convert char offset to byte offset.
    fn char_to_byte(&self, char_offset: usize) -> usize;

    /// Convert byte offset to char offset.
    fn byte_to_char(&self, byte_offset: usize) -> usize;

    /// Get info about the last edit operation, if any.
    fn last_edit(&self) -> Option<EditInfo>;

    /// Char offset of a (line, column) position.
    ///
    /// Returns None if the line doesn't exist or the column runs past the
    /// line's end. The position just after the last char is valid.
    fn position_to_char(&self, position: Position) -> Option<usize> {
        let text = self.to_string();
        let mut line = 0;
        let mut line_start = 0;
        let mut chars = 0;
        for c in text.chars() {
            if line == position.line {
                break;
            }
            chars += 1;
            if c == '\n' {
                line += 1;
                line_start = chars;
            }
        }
        if line != position.line {
            return None;
        }
        let line_len = text
            .chars()
            .skip(line_start)
            .take_while(|c| *c != '\n')
            .count();
        (position.column <= line_len).then_some(line_start + position.column)
    }

    /// (line, column) position of a char offset, clamped to the end.
    fn char_to_position(&self, char_offset: usize) -> Position {
        let text = self.to_string();
        Position::ZERO.advance_chars(text.chars().take(char_offset))
    }
}

/// Ropey-backed text buffer for local editing.
///
/// Provides O(log n) editing operations and offset conversions. Ropey is
/// built with only LF line breaks so line numbers agree with [`Position`].
#[derive(Clone, Default)]
pub struct EditorRope {
    rope: ropey::Rope,
    last_edit: Option<EditInfo>,
}

impl EditorRope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_str(s: &str) -> Self {
        Self {
            rope: ropey::Rope::from_str(s),
            last_edit: None,
        }
    }

    /// Get a reference to the underlying rope (for advanced operations).
    pub fn rope(&self) -> &ropey::Rope {
        &self.rope
    }

    /// Number of lines; an empty rope has one.
    pub fn len_lines(&self) -> usize {
        self.rope.len_lines()
    }

    fn record(&mut self, char_offset: usize, inserted_len: usize, deleted_len: usize, contains_newline: bool) {
        self.last_edit = Some(EditInfo {
            edit_char_pos: char_offset,
            inserted_len,
            deleted_len,
            contains_newline,
            doc_len_after: self.rope.len_chars(),
            timestamp: Instant::now(),
        });
    }
}

impl std::fmt::Debug for EditorRope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorRope")
            .field("len_chars", &self.rope.len_chars())
            .field("last_edit", &self.last_edit)
            .finish()
    }
}

impl TextBuffer for EditorRope {
    fn len_bytes(&self) -> usize {
        self.rope.len_bytes()
    }

    fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    fn insert(&mut self, char_offset: usize, text: &str) {
        self.rope.insert(char_offset, text);
        self.record(char_offset, text.chars().count(), 0, text.contains('\n'));
    }

    fn delete(&mut self, char_range: Range<usize>) {
        let contains_newline = self
            .slice(char_range.clone())
            .map(|s| s.contains('\n'))
            .unwrap_or(false);
        let deleted_len = char_range.len();

        self.rope.remove(char_range.clone());
        self.record(char_range.start, 0, deleted_len, contains_newline);
    }

    fn slice(&self, char_range: Range<usize>) -> Option<SmolStr> {
        if char_range.end > self.len_chars() || char_range.start > char_range.end {
            return None;
        }
        Some(self.rope.slice(char_range).to_smolstr())
    }

    fn char_at(&self, char_offset: usize) -> Option<char> {
        if char_offset >= self.len_chars() {
            return None;
        }
        Some(self.rope.char(char_offset))
    }

    fn to_string(&self) -> String {
        self.rope.to_string()
    }

    fn char_to_byte(&self, char_offset: usize) -> usize {
        self.rope.char_to_byte(char_offset)
    }

    fn byte_to_char(&self, byte_offset: usize) -> usize {
        self.rope.byte_to_char(byte_offset)
    }

    fn last_edit(&self) -> Option<EditInfo> {
        self.last_edit
    }

    fn position_to_char(&self, position: Position) -> Option<usize> {
        if position.line >= self.rope.len_lines() {
            return None;
        }
        let line_start = self.rope.line_to_char(position.line);
        let line = self.rope.line(position.line);
        let mut line_len = line.len_chars();
        if line_len > 0 && line.char(line_len - 1) == '\n' {
            line_len -= 1;
        }
        (position.column <= line_len).then_some(line_start + position.column)
    }

    fn char_to_position(&self, char_offset: usize) -> Position {
        let offset = char_offset.min(self.rope.len_chars());
        let line = self.rope.char_to_line(offset);
        Position::new(line, offset - self.rope.line_to_char(line))
    }
}

impl From<&str> for EditorRope {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<String> for EditorRope {
    fn from(s: String) -> Self {
        Self::from_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut rope = EditorRope::from_str("hello world");
        assert_eq!(rope.len_chars(), 11);

        rope.insert(5, " beautiful");
        assert_eq!(rope.to_string(), "hello beautiful world");

        // " beautiful" is 10 chars at positions 5..15
        rope.delete(5..15);
        assert_eq!(rope.to_string(), "hello world");

        let edit = rope.last_edit().unwrap();
        assert_eq!(edit.deleted_len, 10);
        assert_eq!(edit.doc_len_after, 11);
    }

    #[test]
    fn test_slice_and_char_at() {
        let rope = EditorRope::from_str("hello world");
        assert_eq!(rope.slice(0..5).as_deref(), Some("hello"));
        assert_eq!(rope.slice(0..100), None);
        assert_eq!(rope.char_at(4), Some('o'));
        assert_eq!(rope.char_at(11), None);
    }

    #[test]
    fn test_offset_conversion() {
        // "hello 🌍" - emoji is 4 bytes, 1 char
        let rope = EditorRope::from_str("hello 🌍");
        assert_eq!(rope.len_chars(), 7);
        assert_eq!(rope.len_bytes(), 10);
        assert_eq!(rope.char_to_byte(7), 10);
        assert_eq!(rope.byte_to_char(10), 7);
    }

    #[test]
    fn test_positions() {
        let rope = EditorRope::from_str("ab\ncde\n");
        assert_eq!(rope.position_to_char(Position::new(0, 2)), Some(2));
        assert_eq!(rope.position_to_char(Position::new(1, 0)), Some(3));
        assert_eq!(rope.position_to_char(Position::new(1, 3)), Some(6));
        assert_eq!(rope.position_to_char(Position::new(1, 4)), None);
        assert_eq!(rope.position_to_char(Position::new(2, 0)), Some(7));
        assert_eq!(rope.position_to_char(Position::new(3, 0)), None);

        assert_eq!(rope.char_to_position(4), Position::new(1, 1));
        assert_eq!(rope.char_to_position(7), Position::new(2, 0));
        assert_eq!(rope.char_to_position(99), Position::new(2, 0));
    }

    #[test]
    fn test_carriage_return_is_not_a_line_break() {
        let rope = EditorRope::from_str("a\r\nb\rc");
        assert_eq!(rope.len_lines(), 2);
        assert_eq!(rope.char_to_position(5), Position::new(1, 2));
    }

    #[test]
    fn test_replace() {
        let mut rope = EditorRope::from_str("hello world");
        rope.replace(6..11, "rust");
        assert_eq!(rope.to_string(), "hello rust");
    }
}
