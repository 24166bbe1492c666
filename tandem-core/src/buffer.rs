//! Line-oriented text buffer with editor-style range replacement.
//!
//! The buffer always holds at least one (possibly empty) line. Positions that
//! fall outside the text are clipped rather than rejected, and a reversed
//! range is normalized, mirroring what a code editor does when handed a
//! replace-range call. No further validation happens here: a stale remote
//! change lands wherever its clipped coordinates point.

use log::trace;

use crate::change::Origin;
use crate::Position;

/// Notification produced by every buffer mutation.
///
/// `from`/`to` are the clipped, ordered coordinates in the buffer as it was
/// before the mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferChange {
    pub origin: Origin,
    pub from: Position,
    pub to: Position,
    pub removed: String,
    pub inserted: String,
}

/// In-memory editor buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBuffer {
    lines: Vec<String>,
}

impl TextBuffer {
    /// Create an empty buffer (one empty line).
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
        }
    }

    /// Create a buffer holding `text`. Lines are split on `\n`.
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(str::to_owned).collect(),
        }
    }

    /// Full buffer content.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        self.lines.get(line as usize).map(String::as_str)
    }

    /// Length of a line in characters (0 for a line past the end).
    pub fn line_len(&self, line: u32) -> u32 {
        self.line(line).map_or(0, |l| l.chars().count() as u32)
    }

    /// Total length in characters, counting line breaks.
    pub fn len_chars(&self) -> usize {
        let breaks = self.lines.len() - 1;
        self.lines.iter().map(|l| l.chars().count()).sum::<usize>() + breaks
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].is_empty()
    }

    /// Position just past the last character.
    pub fn end(&self) -> Position {
        let last = (self.lines.len() - 1) as u32;
        Position::new(last, self.line_len(last))
    }

    /// Clamp a position into the buffer.
    pub fn clip(&self, pos: Position) -> Position {
        if pos.line as usize >= self.lines.len() {
            return self.end();
        }
        let len = self.line_len(pos.line);
        if pos.ch > len {
            Position::new(pos.line, len)
        } else {
            pos
        }
    }

    /// Text between two positions (clipped and ordered first).
    pub fn slice(&self, from: Position, to: Position) -> String {
        let (from, to) = self.normalize(from, to);
        let first = &self.lines[from.line as usize];
        if from.line == to.line {
            return first[byte_offset(first, from.ch)..byte_offset(first, to.ch)].to_owned();
        }

        let mut out = String::new();
        out.push_str(&first[byte_offset(first, from.ch)..]);
        for line in &self.lines[from.line as usize + 1..to.line as usize] {
            out.push('\n');
            out.push_str(line);
        }
        let last = &self.lines[to.line as usize];
        out.push('\n');
        out.push_str(&last[..byte_offset(last, to.ch)]);
        out
    }

    /// Replace the range `[from, to)` with `text`.
    pub fn replace_range(
        &mut self,
        from: Position,
        to: Position,
        text: &str,
        origin: Origin,
    ) -> BufferChange {
        let (from, to) = self.normalize(from, to);
        let removed = self.slice(from, to);

        let joined = {
            let first = &self.lines[from.line as usize];
            let last = &self.lines[to.line as usize];
            let mut joined = String::with_capacity(first.len() + text.len() + last.len());
            joined.push_str(&first[..byte_offset(first, from.ch)]);
            joined.push_str(text);
            joined.push_str(&last[byte_offset(last, to.ch)..]);
            joined
        };

        let replacement: Vec<String> = joined.split('\n').map(str::to_owned).collect();
        self.lines
            .splice(from.line as usize..=to.line as usize, replacement);

        BufferChange {
            origin,
            from,
            to,
            removed,
            inserted: text.to_owned(),
        }
    }

    /// Replace the whole content.
    pub fn set_text(&mut self, text: &str, origin: Origin) -> BufferChange {
        let end = self.end();
        self.replace_range(Position::ZERO, end, text, origin)
    }

    fn normalize(&self, from: Position, to: Position) -> (Position, Position) {
        let (a, b) = (self.clip(from), self.clip(to));
        if a != from || b != to {
            trace!("clipped range {from}..{to} to {a}..{b}");
        }
        if b < a {
            (b, a)
        } else {
            (a, b)
        }
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text())
    }
}

/// Position reached after inserting `text` at `from`.
pub fn end_of_insert(from: Position, text: &str) -> Position {
    let mut segments = text.split('\n');
    let first = segments.next().unwrap_or("");
    let mut end = Position::new(from.line, from.ch + first.chars().count() as u32);
    for segment in segments {
        end = Position::new(end.line + 1, segment.chars().count() as u32);
    }
    end
}

/// Byte offset of character `ch` in `line`, saturating at the line end.
fn byte_offset(line: &str, ch: u32) -> usize {
    line.char_indices()
        .nth(ch as usize)
        .map_or(line.len(), |(i, _)| i)
}
