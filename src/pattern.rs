//! Compiled regular expressions and the grammar-relevant traits the engine
//! reads off their source text.
//!
//! The engine's matching primitive needs to know, per pattern, whether it is
//! anchored to the previous match end (`\G`), whether it is a pure
//! end-of-stream assertion (`\z` / `\Z`), whether it contains a look-behind
//! (which triggers the windowed emulation in
//! [`ContentHandler::search`](crate::handler::ContentHandler::search)), and
//! whether it carries an un-escaped end-of-line anchor. All four are derived
//! once at compile time from the pattern source.

use once_cell::sync::Lazy;
use onig::{Region, SearchOptions};

use crate::diagnostics::{Result, TmError};

/// Matches an un-escaped `$` that is not part of a look-ahead group. A match
/// ending exactly at end-of-line under such a pattern is widened by one
/// position to cover the line terminator.
static DOLLAR_NOT_LOOKAHEAD: Lazy<onig::Regex> = Lazy::new(|| {
    onig::Regex::new(r"(?<!\(\?=[^\(]*)(?<!\\)\$").expect("builtin pattern is valid")
});

/// A compiled grammar pattern.
#[derive(Debug)]
pub struct Pattern {
    source: String,
    regex: onig::Regex,
    anchored: bool,
    eos_only: bool,
    lookbehind: bool,
    dollar_eol: bool,
}

/// A raw engine match, relative to the searched window.
#[derive(Debug, Clone)]
pub(crate) struct RawMatch {
    pub start: usize,
    pub end: usize,
    /// Per-group byte spans; `None` for groups that did not participate.
    pub groups: Vec<Option<(usize, usize)>>,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self> {
        let regex = onig::Regex::new(source).map_err(|e| TmError::Regex {
            pattern: source.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
            anchored: source.contains(r"\G"),
            eos_only: source == r"\z" || source == r"\Z",
            lookbehind: source.contains("(?<=") || source.contains("(?<!"),
            dollar_eol: DOLLAR_NOT_LOOKAHEAD.find(source).is_some(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the pattern must continue exactly from the previous match end.
    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    /// Whether the pattern is nothing but an end-of-stream assertion.
    pub fn is_eos_only(&self) -> bool {
        self.eos_only
    }

    /// Whether the pattern contains a look-behind assertion.
    pub fn has_lookbehind(&self) -> bool {
        self.lookbehind
    }

    /// Whether the pattern carries an un-escaped, non-lookahead-guarded `$`.
    pub fn has_eol_anchor(&self) -> bool {
        self.dollar_eol
    }

    /// Number of capture groups in the pattern.
    pub fn captures_len(&self) -> usize {
        self.regex.captures_len()
    }

    /// Searches `window` for the leftmost match, reporting group spans
    /// relative to the window start.
    pub(crate) fn find_in(&self, window: &str) -> Option<RawMatch> {
        let mut region = Region::new();
        self.regex.search_with_options(
            window,
            0,
            window.len(),
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        )?;
        let (start, end) = region.pos(0)?;
        let groups = (0..region.len()).map(|i| region.pos(i)).collect();
        Some(RawMatch { start, end, groups })
    }
}
