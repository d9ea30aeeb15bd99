//! Position-addressed content model and the regex-search primitive.
//!
//! Content is addressed by `(line, column)` pairs, zero-based, ordered
//! lexicographically. Columns are byte offsets into the line and always fall
//! on UTF-8 character boundaries. Every line keeps its trailing `\n`; the
//! line-splitting scheme gives the final line a virtual terminator as well,
//! so the last addressable position of a buffer sits one past the last line's
//! terminator.
//!
//! The handler is read-only for the lifetime of a parse, except for a single
//! `anchor` column that tracks the end of the most recent successful match.
//! Patterns anchored with `\G` resume from it instead of from their given
//! starting position.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;

use crate::diagnostics::{Result, TmError};
use crate::pattern::Pattern;

/// A `(line, column)` address, zero-based.
pub type Pos = (usize, usize);

/// An ordered pair of positions, start inclusive, close exclusive.
pub type Span = (Pos, Pos);

/// Maximum number of bytes of left context examined when emulating a
/// look-behind assertion. The search window widens one character at a time up
/// to this budget; a look-behind that needs more context than this silently
/// fails to match.
pub const MAX_LOOKBEHIND: usize = 32;

/// Replaces Windows and legacy Mac line terminators with `\n`. Callers are
/// expected to run this (or an equivalent) before constructing a handler.
pub fn normalize_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// A successful engine match, with group spans in buffer coordinates.
#[derive(Debug, Clone)]
pub struct Matching {
    line: usize,
    text: String,
    groups: Vec<Option<(usize, usize)>>,
    captures_len: usize,
}

impl Matching {
    /// The full matched text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of capture groups declared by the originating pattern.
    pub fn captures_len(&self) -> usize {
        self.captures_len
    }

    /// The span of capture group `idx`, or `None` if the group did not
    /// participate in the match.
    pub fn group_span(&self, idx: usize) -> Option<Span> {
        let (s, e) = (*self.groups.get(idx)?)?;
        Some(((self.line, s), (self.line, e)))
    }
}

/// The handler object targeted by parsing: an immutable line buffer plus the
/// match anchor, with all read and search operations the engine needs.
#[derive(Debug)]
pub struct ContentHandler {
    content: String,
    lines: Vec<String>,
    pub(crate) anchor: usize,
}

impl ContentHandler {
    /// Builds a handler over already-normalized content.
    pub fn new(content: &str) -> Self {
        let lines = content.split('\n').map(|l| format!("{l}\n")).collect();
        Self {
            content: content.to_string(),
            lines,
            anchor: 0,
        }
    }

    /// Reads a file, normalizes its line endings, and builds a handler.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::new(&normalize_line_endings(&raw)))
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// End offset of the most recent successful match.
    pub fn anchor(&self) -> usize {
        self.anchor
    }

    /// The last addressable position of the buffer.
    pub fn doc_end(&self) -> Pos {
        let last = self.lines.len() - 1;
        (last, self.lines[last].len())
    }

    fn check_pos(&self, pos: Pos) -> Result<()> {
        let valid = pos.0 < self.lines.len()
            && pos.1 <= self.lines[pos.0].len()
            && self.lines[pos.0].is_char_boundary(pos.1);
        if valid {
            Ok(())
        } else {
            Err(TmError::OutOfBounds { pos })
        }
    }

    fn char_at(&self, pos: Pos) -> Option<char> {
        self.lines.get(pos.0)?.get(pos.1..)?.chars().next()
    }

    /// Steps `pos` forward by `step` characters, crossing line boundaries.
    /// Stepping past the final line yields a position one line beyond the
    /// buffer, which compares greater than every in-buffer position; the scan
    /// loops rely on this to terminate.
    pub fn next(&self, pos: Pos, step: usize) -> Pos {
        let mut pos = pos;
        for _ in 0..step {
            if pos.0 >= self.lines.len() {
                return pos;
            }
            let line = &self.lines[pos.0];
            pos = if pos.1 >= line.len() {
                (pos.0 + 1, 0)
            } else {
                let width = line[pos.1..].chars().next().map_or(1, char::len_utf8);
                (pos.0, pos.1 + width)
            };
        }
        pos
    }

    /// Steps `pos` backward by `step` characters, clamped at the buffer
    /// start.
    pub fn prev(&self, pos: Pos, step: usize) -> Pos {
        let mut pos = pos;
        for _ in 0..step {
            if pos.0 >= self.lines.len() {
                return self.doc_end();
            }
            pos = if pos.1 == 0 {
                if pos.0 == 0 {
                    (0, 0)
                } else {
                    (pos.0 - 1, self.lines[pos.0 - 1].len())
                }
            } else {
                let line = &self.lines[pos.0];
                let mut col = pos.1 - 1;
                while col > 0 && !line.is_char_boundary(col) {
                    col -= 1;
                }
                (pos.0, col)
            };
        }
        pos
    }

    fn char_cols<'a>(&'a self, ln: usize, from: usize, to: usize) -> impl Iterator<Item = Pos> + 'a {
        self.lines[ln][from..to]
            .char_indices()
            .map(move |(i, _)| (ln, from + i))
    }

    /// Enumerates every character position in `[start, close)`.
    pub fn range(&self, start: Pos, close: Pos) -> Result<Vec<Pos>> {
        self.check_pos(start)?;
        self.check_pos(close)?;
        if start > close {
            return Err(TmError::InvalidSpan { start, close });
        }
        let mut out = Vec::new();
        if start.0 == close.0 {
            out.extend(self.char_cols(start.0, start.1, close.1));
        } else {
            out.extend(self.char_cols(start.0, start.1, self.lines[start.0].len()));
            for ln in start.0 + 1..close.0 {
                out.extend(self.char_cols(ln, 0, self.lines[ln].len()));
            }
            out.extend(self.char_cols(close.0, 0, close.1));
        }
        Ok(out)
    }

    /// Maps every position in `[start, close)` to its source character.
    pub fn chars(&self, start: Pos, close: Pos) -> Result<BTreeMap<Pos, char>> {
        let mut map = BTreeMap::new();
        for pos in self.range(start, close)? {
            if let Some(c) = self.char_at(pos) {
                map.insert(pos, c);
            }
        }
        Ok(map)
    }

    /// Reads `length` characters starting at `start`. Reading past the end of
    /// the buffer yields an empty string. With `skip_newline`, one trailing
    /// line terminator is stripped from the result.
    pub fn read(&self, start: Pos, length: usize, skip_newline: bool) -> Result<String> {
        self.check_pos(start)?;
        let mut out = String::new();
        let mut pos = start;
        for _ in 0..length {
            // The one-past-terminator column addresses no character; the
            // read continues on the next line.
            if pos.0 < self.lines.len() && pos.1 >= self.lines[pos.0].len() {
                pos = (pos.0 + 1, 0);
            }
            match self.char_at(pos) {
                Some(c) => {
                    out.push(c);
                    pos = self.next(pos, 1);
                }
                None => return Ok(String::new()),
            }
        }
        if skip_newline && out.ends_with('\n') {
            out.pop();
        }
        Ok(out)
    }

    /// Reads the content between `start` and `close`. With `skip_newline`,
    /// one trailing line terminator is stripped.
    pub fn read_span(&self, start: Pos, close: Pos, skip_newline: bool) -> Result<String> {
        self.check_pos(start)?;
        self.check_pos(close)?;
        if start > close {
            return Err(TmError::InvalidSpan { start, close });
        }
        let out = if start.0 == close.0 {
            self.lines[start.0][start.1..close.1].to_string()
        } else {
            let mut acc = self.lines[start.0][start.1..].to_string();
            for ln in start.0 + 1..close.0 {
                acc.push_str(&self.lines[ln]);
            }
            acc.push_str(&self.lines[close.0][..close.1]);
            acc
        };
        let mut out = out;
        if skip_newline && out.ends_with('\n') {
            out.pop();
        }
        Ok(out)
    }

    /// The remainder of the line containing `pos`.
    pub fn read_line(&self, pos: Pos) -> &str {
        self.lines
            .get(pos.0)
            .and_then(|l| l.get(pos.1..))
            .unwrap_or("")
    }

    /// The matching primitive: searches the line containing `starting` (or
    /// its prefix up to `boundary`, if the boundary falls on the same line)
    /// for `pattern`.
    ///
    /// Patterns anchored with `\G` search from the stored anchor instead of
    /// from `starting`. Pure end-of-stream patterns are forced greedy so
    /// their match at end-of-line is always accepted. Look-behind patterns
    /// are matched through a window that widens to the left, one character
    /// at a time up to [`MAX_LOOKBEHIND`], until the engine reports a match
    /// starting at or after the search origin; exhausting the budget is a
    /// plain non-match.
    ///
    /// Characters between the search origin and the match start form the
    /// leading string. The match is rejected outright unless the leading
    /// string is empty, `greedy` is set, or it is pure whitespace.
    ///
    /// On acceptance the anchor is updated to the match end and the accepted
    /// span is returned; if an un-escaped end-of-line anchor matched right
    /// before the terminator, the span is widened by one to cover it.
    pub fn search(
        &mut self,
        pattern: &Pattern,
        starting: Pos,
        boundary: Option<Pos>,
        greedy: bool,
    ) -> Option<(Matching, Span)> {
        let ln = starting.0;
        if ln >= self.lines.len() {
            return None;
        }
        let full_len = self.lines[ln].len();
        let line: &str = match boundary {
            Some(b) if b.0 == ln => &self.lines[ln][..b.1.min(full_len)],
            _ => &self.lines[ln],
        };
        let greedy = greedy || pattern.is_eos_only();
        let init = if pattern.is_anchored() {
            self.anchor
        } else {
            starting.1
        };
        if init > line.len() || !line.is_char_boundary(init) {
            return None;
        }

        let (m, shift) = if !pattern.has_lookbehind() {
            (pattern.find_in(&line[init..])?, init)
        } else {
            let floor = init.saturating_sub(MAX_LOOKBEHIND);
            let mut shift = init;
            loop {
                if let Some(m) = pattern.find_in(&line[shift..]) {
                    if shift + m.start >= init {
                        break (m, shift);
                    }
                }
                if shift == 0 || shift <= floor {
                    return None;
                }
                shift -= 1;
                while shift > 0 && !line.is_char_boundary(shift) {
                    shift -= 1;
                }
            }
        };

        let abs_start = shift + m.start;
        let abs_end = shift + m.end;
        let leading = &line[init..abs_start];
        let leading_is_ws = leading.chars().all(char::is_whitespace);
        if !leading.is_empty() && !greedy && !leading_is_ws {
            return None;
        }

        let start_pos = (ln, abs_start);
        let mut close_pos = (ln, abs_end);
        if let Some(b) = boundary {
            if close_pos > b {
                return None;
            }
        }
        if !leading.is_empty() && !leading_is_ws && greedy {
            warn!("skipping <{leading}> at {start_pos:?}");
        }

        // Include the line terminator in the span when an end-of-line anchor
        // matched just before it.
        if pattern.has_eol_anchor() && abs_end + 1 == full_len && !line.is_empty() {
            if let Some(again) = pattern.find_in(&line[shift..line.len() - 1]) {
                if (again.start, again.end) == (m.start, m.end) {
                    close_pos = (ln, abs_end + 1);
                }
            }
        }

        self.anchor = abs_end;

        let matching = Matching {
            line: ln,
            text: line[abs_start..abs_end].to_string(),
            groups: m
                .groups
                .iter()
                .map(|g| g.map(|(s, e)| (s + shift, e + shift)))
                .collect(),
            captures_len: pattern.captures_len(),
        };
        Some((matching, (start_pos, close_pos)))
    }
}
