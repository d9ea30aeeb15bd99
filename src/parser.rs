//! The rule parsers and their matching state machines.
//!
//! Every grammar rule compiles into exactly one parser variant: a plain
//! token, a single-expression match, an aggregation of sub-patterns, or a
//! begin/end block. Parsers live in an arena owned by the language and refer
//! to each other through [`ParserId`] handles; includes start out as symbolic
//! references and are resolved against the repository before any parsing
//! happens.
//!
//! A parse never fails just because nothing matched. The scan loops report
//! no-match through [`ParseOutcome::matched`] and reserve `Err` for grammar
//! defects and impossible coordinates.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::diagnostics::{Result, TmError};
use crate::elements::{Capture, ContentElement, Node};
use crate::grammar::Rule;
use crate::handler::{ContentHandler, Pos, Span};
use crate::language::LanguageParser;
use crate::pattern::Pattern;

/// Handle of a parser in its language's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParserId(pub(crate) usize);

/// A reference to another parser: either resolved to a handle or an include
/// key awaiting repository resolution.
#[derive(Debug, Clone)]
pub(crate) enum ParserRef {
    Resolved(ParserId),
    Include(String),
}

impl ParserRef {
    pub(crate) fn resolved(&self) -> Option<ParserId> {
        match self {
            ParserRef::Resolved(id) => Some(*id),
            ParserRef::Include(_) => None,
        }
    }
}

/// A capture table: group number to parser, in ascending group order.
pub(crate) type CaptureTable = Vec<(usize, ParserRef)>;

#[derive(Debug)]
pub(crate) struct ParserCommon {
    pub key: String,
    pub token: Option<String>,
    pub disabled: bool,
    pub is_capture: bool,
    /// The rule's match or begin expression contains `\G`; such parsers only
    /// take part in the first scan round after a begin match.
    pub anchored: bool,
    pub initialized: bool,
    /// Index of the grammar space (root or embedded external grammar) the
    /// parser belongs to.
    pub space: usize,
}

#[derive(Debug)]
pub(crate) enum ParserKind {
    Token,
    Match {
        pattern: Pattern,
        captures: CaptureTable,
    },
    Patterns {
        patterns: Vec<ParserRef>,
    },
    BeginEnd {
        begin: Pattern,
        end: Pattern,
        patterns: Vec<ParserRef>,
        begin_captures: CaptureTable,
        end_captures: CaptureTable,
        /// The rule had a `contentName`: the element covers only the content
        /// between the begin and end matches.
        between_content: bool,
        apply_end_pattern_last: bool,
    },
    BeginWhile {
        begin: Pattern,
        while_: Pattern,
        patterns: Vec<ParserRef>,
        begin_captures: CaptureTable,
        while_captures: CaptureTable,
    },
}

#[derive(Debug)]
pub(crate) struct Parser {
    pub common: ParserCommon,
    pub kind: ParserKind,
}

/// Compiles a rule into the arena, returning its reference. A bare include
/// compiles to a symbolic reference instead of a parser.
pub(crate) fn compile_rule(
    arena: &mut Vec<Parser>,
    rule: &Rule,
    key: &str,
    is_capture: bool,
    space: usize,
) -> Result<ParserRef> {
    if let Some(include) = &rule.include {
        return Ok(ParserRef::Include(include.clone()));
    }

    let mut token = rule.name.clone();
    let mut anchored = false;

    let kind = if let Some(source) = &rule.match_ {
        anchored = source.contains(r"\G");
        ParserKind::Match {
            pattern: Pattern::new(source)?,
            captures: compile_captures(arena, &rule.captures, key, space)?,
        }
    } else if let (Some(begin), Some(end)) = (&rule.begin, &rule.end) {
        anchored = begin.contains(r"\G");
        let between_content = rule.content_name.is_some();
        if let Some(content_name) = &rule.content_name {
            token = Some(content_name.clone());
        }
        ParserKind::BeginEnd {
            begin: Pattern::new(begin)?,
            end: Pattern::new(end)?,
            patterns: compile_patterns(arena, &rule.patterns, key, space)?,
            begin_captures: compile_captures(arena, &rule.begin_captures, key, space)?,
            end_captures: compile_captures(arena, &rule.end_captures, key, space)?,
            between_content,
            apply_end_pattern_last: rule.apply_end_pattern_last,
        }
    } else if let (Some(begin), Some(while_)) = (&rule.begin, &rule.while_) {
        if let Some(content_name) = &rule.content_name {
            token = Some(content_name.clone());
        }
        ParserKind::BeginWhile {
            begin: Pattern::new(begin)?,
            while_: Pattern::new(while_)?,
            patterns: compile_patterns(arena, &rule.patterns, key, space)?,
            begin_captures: compile_captures(arena, &rule.begin_captures, key, space)?,
            while_captures: compile_captures(arena, &rule.while_captures, key, space)?,
        }
    } else if !rule.patterns.is_empty() {
        ParserKind::Patterns {
            patterns: compile_patterns(arena, &rule.patterns, key, space)?,
        }
    } else {
        ParserKind::Token
    };

    arena.push(Parser {
        common: ParserCommon {
            key: key.to_string(),
            token,
            disabled: rule.disabled,
            is_capture,
            anchored,
            initialized: matches!(kind, ParserKind::Token),
            space,
        },
        kind,
    });
    Ok(ParserRef::Resolved(ParserId(arena.len() - 1)))
}

fn compile_patterns(
    arena: &mut Vec<Parser>,
    rules: &[Rule],
    key: &str,
    space: usize,
) -> Result<Vec<ParserRef>> {
    rules
        .iter()
        .map(|rule| compile_rule(arena, rule, key, false, space))
        .collect()
}

fn compile_captures(
    arena: &mut Vec<Parser>,
    table: &BTreeMap<String, Rule>,
    key: &str,
    space: usize,
) -> Result<CaptureTable> {
    let mut out = Vec::new();
    for (group, rule) in table {
        let group_id: usize = match group.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("ignoring non-numeric capture group <{group}> of <{key}>");
                continue;
            }
        };
        let capture_key = format!("{key}:{group_id}");
        out.push((group_id, compile_rule(arena, rule, &capture_key, true, space)?));
    }
    out.sort_by_key(|(group_id, _)| *group_id);
    Ok(out)
}

/// Options threaded through a parse call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOpts<'a> {
    /// Accept matches with arbitrary leading characters, not just whitespace.
    pub greedy: bool,
    /// Stop an aggregation scan at its first successful match.
    pub find_one: bool,
    /// The capture this parse was dispatched from, for loop detection.
    pub parent: Option<&'a Capture>,
}

/// The result of a parse call. `matched == false` is the no-match channel
/// and carries no nodes.
#[derive(Debug)]
pub struct ParseOutcome {
    pub matched: bool,
    pub nodes: Vec<Node>,
    pub span: Option<Span>,
}

impl ParseOutcome {
    fn no_match() -> Self {
        Self {
            matched: false,
            nodes: Vec::new(),
            span: None,
        }
    }

    fn of(nodes: Vec<Node>, span: Span) -> Self {
        Self {
            matched: true,
            nodes,
            span: Some(span),
        }
    }

    fn span_or(&self, fallback: Pos) -> Span {
        self.span.unwrap_or((fallback, fallback))
    }
}

/// Runs one parser over the handler.
pub(crate) fn parse_one(
    lang: &LanguageParser,
    id: ParserId,
    handler: &mut ContentHandler,
    starting: Pos,
    boundary: Option<Pos>,
    opts: ParseOpts<'_>,
) -> Result<ParseOutcome> {
    let parser = lang.parser(id);
    // A language root always scans its whole region, even when included as a
    // sub-pattern.
    let opts = if lang.is_space_root(id) {
        ParseOpts {
            find_one: false,
            ..opts
        }
    } else {
        opts
    };
    match &parser.kind {
        ParserKind::Token => parse_token(lang, id, handler, starting, boundary),
        ParserKind::Match { pattern, captures } => {
            parse_match(lang, id, handler, starting, boundary, opts, pattern, captures)
        }
        ParserKind::Patterns { patterns } => {
            parse_patterns(lang, id, handler, starting, boundary, opts, patterns)
        }
        ParserKind::BeginEnd {
            begin,
            end,
            patterns,
            begin_captures,
            end_captures,
            between_content,
            apply_end_pattern_last,
        } => parse_begin_end(
            lang,
            id,
            handler,
            starting,
            boundary,
            opts,
            BeginEndRule {
                begin,
                end,
                patterns,
                begin_captures,
                end_captures,
                between_content: *between_content,
                apply_end_pattern_last: *apply_end_pattern_last,
            },
        ),
        ParserKind::BeginWhile { .. } => Err(TmError::Unsupported {
            key: parser.common.key.clone(),
        }),
    }
}

/// The enabled, resolved entries of a pattern list.
fn active(lang: &LanguageParser, refs: &[ParserRef]) -> Vec<ParserId> {
    refs.iter()
        .filter_map(ParserRef::resolved)
        .filter(|id| !lang.parser(*id).common.disabled)
        .collect()
}

fn display_token(parser: &Parser) -> Option<&str> {
    parser.common.token.as_deref().filter(|t| !t.is_empty())
}

fn parse_token(
    lang: &LanguageParser,
    id: ParserId,
    handler: &mut ContentHandler,
    starting: Pos,
    boundary: Option<Pos>,
) -> Result<ParseOutcome> {
    let parser = lang.parser(id);
    let boundary = boundary.ok_or_else(|| TmError::IndeterminateBoundary {
        key: parser.common.key.clone(),
    })?;
    let content = handler.read_span(starting, boundary, true)?;
    let characters = handler.chars(starting, boundary)?;
    handler.anchor = boundary.1;
    debug!("token <{}> found <{content:?}>", parser.common.key);
    let element = ContentElement::new(
        parser.common.token.clone().unwrap_or_default(),
        id,
        content,
        (starting, boundary),
        characters,
        Vec::new(),
    );
    Ok(ParseOutcome::of(
        vec![Node::Element(element)],
        (starting, boundary),
    ))
}

/// Matches a pattern and wraps its capture table, if any, into a deferred
/// [`Capture`] node. A capture identical to the parse's parent capture is
/// treated as no-match to break self-recursion.
#[allow(clippy::too_many_arguments)]
fn match_and_capture(
    handler: &mut ContentHandler,
    pattern: &Pattern,
    captures: &CaptureTable,
    origin: ParserId,
    key: &str,
    starting: Pos,
    boundary: Option<Pos>,
    greedy: bool,
    parent: Option<&Capture>,
) -> Option<(Span, String, Vec<Node>)> {
    let (matching, span) = handler.search(pattern, starting, boundary, greedy)?;
    let text = matching.text().to_string();
    if captures.is_empty() {
        return Some((span, text, Vec::new()));
    }
    let capture = Capture {
        key: key.to_string(),
        origin,
        groups: (0..=matching.captures_len())
            .map(|i| matching.group_span(i))
            .collect(),
        group_count: matching.captures_len(),
        parsers: captures
            .iter()
            .filter_map(|(group, r)| r.resolved().map(|id| (*group, id)))
            .collect(),
        starting,
        boundary,
        text: text.clone(),
    };
    if parent.map_or(false, |p| *p == capture) {
        return None;
    }
    Some((span, text, vec![Node::Capture(capture)]))
}

#[allow(clippy::too_many_arguments)]
fn parse_match(
    lang: &LanguageParser,
    id: ParserId,
    handler: &mut ContentHandler,
    starting: Pos,
    boundary: Option<Pos>,
    opts: ParseOpts<'_>,
    pattern: &Pattern,
    captures: &CaptureTable,
) -> Result<ParseOutcome> {
    let parser = lang.parser(id);
    let key = &parser.common.key;
    let Some((span, content, captured)) = match_and_capture(
        handler,
        pattern,
        captures,
        id,
        key,
        starting,
        boundary,
        opts.greedy,
        opts.parent,
    ) else {
        debug!("match <{key}>: no match");
        return Ok(ParseOutcome::no_match());
    };
    debug!("match <{key}> found <{content:?}>");

    let nodes = match display_token(parser) {
        Some(token) => {
            let element = ContentElement::new(
                token.to_string(),
                id,
                content,
                span,
                handler.chars(span.0, span.1)?,
                captured,
            );
            vec![Node::Element(element)]
        }
        None => captured,
    };
    Ok(ParseOutcome::of(nodes, span))
}

/// The aggregation scan: repeatedly matches the first fitting sub-pattern
/// until the boundary is reached. Each round runs a strict pass in
/// declaration order; if nothing matched, a relaxed pass collects every
/// candidate and picks the winner by (match start, declaration order). Only
/// the root language parser skips unparseable lines; everywhere else the
/// scan just ends.
fn parse_patterns(
    lang: &LanguageParser,
    id: ParserId,
    handler: &mut ContentHandler,
    starting: Pos,
    boundary: Option<Pos>,
    opts: ParseOpts<'_>,
    patterns: &[ParserRef],
) -> Result<ParseOutcome> {
    let parser = lang.parser(id);
    let boundary = boundary.unwrap_or_else(|| handler.doc_end());
    let patterns = active(lang, patterns);
    let is_root = lang.is_space_root(id);
    let child_opts = |greedy| ParseOpts {
        greedy,
        find_one: true,
        parent: opts.parent,
    };

    let mut elements: Vec<Node> = Vec::new();
    let mut current = starting;

    while current < boundary {
        let round_start = current;
        let mut parsed = false;

        for &pid in &patterns {
            let outcome = parse_one(lang, pid, handler, current, Some(boundary), child_opts(opts.greedy))?;
            if outcome.matched {
                parsed = true;
                let span = outcome.span_or(current);
                if opts.find_one {
                    debug!("patterns <{}> found single element", parser.common.key);
                    return Ok(ParseOutcome::of(outcome.nodes, span));
                }
                elements.extend(outcome.nodes);
                current = span.1;
                break;
            }
        }
        if !parsed && opts.find_one {
            break;
        }

        if !parsed && !opts.greedy {
            // Relaxed round: allow leading characters, pick the earliest
            // match, breaking ties by declaration order.
            let mut best: Option<(Pos, usize)> = None;
            let mut best_nodes = Vec::new();
            let mut best_close = current;
            for (index, &pid) in patterns.iter().enumerate() {
                let outcome = parse_one(lang, pid, handler, current, Some(boundary), child_opts(true))?;
                if outcome.matched {
                    let span = outcome.span_or(current);
                    if best.map_or(true, |b| (span.0, index) < b) {
                        best = Some((span.0, index));
                        best_nodes = outcome.nodes;
                        best_close = span.1;
                    }
                }
            }
            if best.is_some() {
                elements.extend(best_nodes);
                current = best_close;
            } else if !is_root {
                break;
            } else {
                let remainder = handler.read_line(current);
                if !remainder.trim().is_empty() {
                    warn!("remainder of line not parsed: <{remainder:?}>");
                }
                if current.0 + 1 <= handler.line_count() {
                    current = (current.0 + 1, 0);
                } else {
                    break;
                }
            }
        }

        if current == starting {
            warn!("scan of <{}> did not move from its starting position", parser.common.key);
            break;
        }

        if current.0 >= handler.line_count() {
            break;
        }

        // A scan stranded at a line terminator jumps to the next line that
        // has any content.
        let line_length = handler.lines()[current.0].len();
        if current.1 == line_length || current.1 + 1 == line_length {
            match (current.0 + 1..handler.line_count()).find(|&i| handler.lines()[i].len() > 1) {
                Some(next_line) => current = (next_line, 0),
                None => break,
            }
        }

        if current == round_start {
            warn!("scan of <{}> did not advance, aborting", parser.common.key);
            break;
        }
    }

    let matched;
    let nodes = match display_token(parser) {
        Some(token) => {
            let content = handler.read_span(starting, boundary, true)?;
            let characters = handler.chars(starting, boundary)?;
            matched = true;
            vec![Node::Element(ContentElement::new(
                token.to_string(),
                id,
                content,
                (starting, boundary),
                characters,
                elements,
            ))]
        }
        None => {
            matched = !elements.is_empty();
            elements
        }
    };
    Ok(ParseOutcome {
        matched,
        nodes,
        span: Some((starting, current)),
    })
}

struct BeginEndRule<'a> {
    begin: &'a Pattern,
    end: &'a Pattern,
    patterns: &'a [ParserRef],
    begin_captures: &'a CaptureTable,
    end_captures: &'a CaptureTable,
    between_content: bool,
    apply_end_pattern_last: bool,
}

/// The begin/end block scan. After the begin match, each round tries the
/// sub-patterns and the end pattern (strict first, then relaxed) and applies
/// the overlap rules: an end match wholly before the pattern closes the
/// block, a pattern wholly before the end continues it, and on ties
/// `applyEndPatternLast` (or self-recursion) gives the pattern priority.
fn parse_begin_end(
    lang: &LanguageParser,
    id: ParserId,
    handler: &mut ContentHandler,
    starting: Pos,
    boundary: Option<Pos>,
    opts: ParseOpts<'_>,
    rule: BeginEndRule<'_>,
) -> Result<ParseOutcome> {
    let parser = lang.parser(id);
    let key = &parser.common.key;

    let Some((begin_span, _, begin_nodes)) = match_and_capture(
        handler,
        rule.begin,
        rule.begin_captures,
        id,
        key,
        starting,
        boundary,
        opts.greedy,
        opts.parent,
    ) else {
        debug!("begin/end <{key}>: no begin match");
        return Ok(ParseOutcome::no_match());
    };
    debug!("begin/end <{key}> found begin");

    let mut current = begin_span.1;
    let boundary = boundary.unwrap_or_else(|| handler.doc_end());
    // closing = content close, end_close = block close.
    let close_at = |end_span: Span| {
        if rule.between_content {
            (end_span.0, end_span.1)
        } else {
            (end_span.1, end_span.1)
        }
    };
    let child_opts = |greedy| ParseOpts {
        greedy,
        find_one: true,
        parent: opts.parent,
    };

    let mut mid_nodes: Vec<Node> = Vec::new();
    let mut end_nodes: Vec<Node> = Vec::new();
    let mut patterns = active(lang, rule.patterns);
    let mut first_run = true;

    let (closing, end_close) = loop {
        if current > boundary {
            // Boundary exhausted without an end match: close implicitly.
            break (boundary, boundary);
        }
        let round_start = current;

        // When this parser matched itself as a sub-pattern, its end must be
        // applied last or the inner end would close the outer block too.
        let mut recursed = false;
        let mut parsed = false;
        let mut capture_nodes: Vec<Node> = Vec::new();
        let mut capture_span = (current, current);

        for &pid in &patterns {
            let outcome = parse_one(lang, pid, handler, current, Some(boundary), child_opts(false))?;
            if outcome.matched {
                parsed = true;
                capture_span = outcome.span_or(current);
                capture_nodes = outcome.nodes;
                recursed = pid == id;
                break;
            }
        }

        let mut end_result = match_and_capture(
            handler,
            rule.end,
            rule.end_captures,
            id,
            key,
            current,
            Some(boundary),
            false,
            opts.parent,
        );

        if !parsed && end_result.is_none() {
            // Relaxed round over patterns and end alike.
            let mut best: Option<(Pos, usize)> = None;
            let mut best_pid = id;
            let mut best_nodes = Vec::new();
            let mut best_span = (current, current);
            for (index, &pid) in patterns.iter().enumerate() {
                let outcome = parse_one(lang, pid, handler, current, Some(boundary), child_opts(true))?;
                if outcome.matched {
                    let span = outcome.span_or(current);
                    if best.map_or(true, |b| (span.0, index) < b) {
                        best = Some((span.0, index));
                        best_pid = pid;
                        best_nodes = outcome.nodes;
                        best_span = span;
                    }
                }
            }
            if best.is_some() {
                parsed = true;
                capture_span = best_span;
                capture_nodes = best_nodes;
                recursed = best_pid == id;
            }
            end_result = match_and_capture(
                handler,
                rule.end,
                rule.end_captures,
                id,
                key,
                current,
                Some(boundary),
                true,
                opts.parent,
            );
        }

        // End captures only live for the round that produced them; a
        // deprioritized end must not leak into an implicit close.
        end_nodes.clear();
        if let Some((end_span, _, found_end_nodes)) = end_result {
            end_nodes = found_end_nodes;
            if parsed {
                // A pattern ending in a line terminator counts as closing on
                // either side of it.
                let capture_before_end = handler.prev(capture_span.1, 1);
                let pattern_at_end = if handler.read(capture_before_end, 1, false)? == "\n" {
                    end_span.1 == capture_before_end || end_span.1 == capture_span.1
                } else {
                    end_span.1 == capture_span.1
                };
                let end_before_pattern = end_span.0 <= capture_span.0;
                let empty_span_end = end_span.1 == end_span.0;

                if pattern_at_end && (end_before_pattern || empty_span_end) {
                    if empty_span_end {
                        // Zero-width end at the pattern close: accept both.
                        mid_nodes.extend(capture_nodes);
                        break close_at(end_span);
                    } else if !rule.apply_end_pattern_last && !recursed {
                        break close_at(end_span);
                    } else {
                        mid_nodes.extend(capture_nodes);
                        current = capture_span.1;
                    }
                } else if capture_span.0 < end_span.0 {
                    mid_nodes.extend(capture_nodes);
                    current = capture_span.1;
                } else {
                    break close_at(end_span);
                }
            } else {
                break close_at(end_span);
            }
        } else if parsed {
            mid_nodes.extend(capture_nodes);
            if handler.read(capture_span.1, 1, false)? == "\n" {
                // Only stay on the terminator when the end pattern can match
                // right behind the pattern; otherwise skip it.
                let retry = match_and_capture(
                    handler,
                    rule.end,
                    rule.end_captures,
                    id,
                    key,
                    capture_span.1,
                    Some(boundary),
                    false,
                    opts.parent,
                );
                let fits = retry
                    .map_or(false, |(end_span, _, _)| end_span.1 <= handler.next(capture_span.1, 1));
                current = if fits {
                    capture_span.1
                } else {
                    handler.next(capture_span.1, 1)
                };
            } else {
                current = capture_span.1;
            }
        } else {
            // Nothing in this line: skip it.
            let line = handler.read_line(current);
            if !line.trim().is_empty() {
                warn!("no patterns found in line, skipping <{line:?}>");
            }
            current = (current.0 + 1, 0);
        }

        if recursed {
            current = handler.next(current, 1);
        }
        if first_run {
            // Parsers anchored to the begin match only apply directly after
            // it.
            patterns.retain(|&pid| !lang.parser(pid).common.anchored);
            first_run = false;
        }
        if current == round_start {
            warn!("scan of <{key}> did not advance, closing block");
            break (boundary, boundary);
        }
    };

    let start = if rule.between_content {
        begin_span.1
    } else {
        begin_span.0
    };
    let content = handler.read_span(start, closing, true)?;
    debug!("begin/end <{key}> found <{content:?}>");

    let nodes = match display_token(parser) {
        Some(token) => vec![Node::Element(ContentElement::new_block(
            token.to_string(),
            id,
            content,
            (start, closing),
            handler.chars(start, closing)?,
            mid_nodes,
            begin_nodes,
            end_nodes,
        ))],
        None => {
            let mut all = begin_nodes;
            all.extend(mid_nodes);
            all.extend(end_nodes);
            all
        }
    };
    Ok(ParseOutcome::of(nodes, (begin_span.0, end_close)))
}
