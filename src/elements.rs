//! Parse-tree nodes: resolved elements and deferred capture dispatches.
//!
//! A parse produces a tree of [`ContentElement`]s, but capture tables are not
//! expanded eagerly. Instead a successful match with captures yields a
//! [`Capture`] node that records everything needed to run the capture parsers
//! later; [`ContentElement::dispatch`] expands these on first use and
//! memoizes the result. Consumers that only need the top-level tokens never
//! pay for capture expansion.

use std::collections::BTreeMap;

use log::warn;
use serde_json::{json, Map, Value};

use crate::diagnostics::Result;
use crate::handler::{ContentHandler, Pos, Span};
use crate::language::LanguageParser;
use crate::parser::{ParseOpts, ParserId};

/// A produced parse node: either a fully formed element or a capture whose
/// sub-parse has been deferred.
#[derive(Debug, Clone)]
pub enum Node {
    Element(ContentElement),
    Capture(Capture),
}

/// A deferred capture dispatch: the group spans of a successful match plus
/// the group-to-parser table to run over them.
#[derive(Debug, Clone)]
pub struct Capture {
    pub(crate) key: String,
    pub(crate) origin: ParserId,
    pub(crate) groups: Vec<Option<Span>>,
    pub(crate) group_count: usize,
    pub(crate) parsers: Vec<(usize, ParserId)>,
    pub(crate) starting: Pos,
    pub(crate) boundary: Option<Pos>,
    pub(crate) text: String,
}

impl PartialEq for Capture {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.starting == other.starting && self.text == other.text
    }
}

impl Capture {
    /// Runs every entry of the capture table over its group span, returning
    /// the produced nodes. Out-of-range groups are skipped with a warning;
    /// empty and non-participating groups are skipped silently. A capture
    /// parser pointed back at its own originating span is skipped to break
    /// the recursion.
    pub(crate) fn dispatch(
        &self,
        lang: &LanguageParser,
        handler: &mut ContentHandler,
    ) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for &(group_id, parser_id) in &self.parsers {
            if group_id > self.group_count {
                warn!(
                    "capture group {group_id} does not exist in pattern of <{}>",
                    self.key
                );
                continue;
            }
            let span = match self.groups.get(group_id).copied().flatten() {
                Some(span) if span.0 != span.1 => span,
                _ => continue,
            };
            if parser_id == self.origin && span.0 == self.starting && Some(span.1) == self.boundary {
                warn!("parser loop detected in <{}>, skipping capture group", self.key);
                continue;
            }
            let opts = ParseOpts {
                greedy: false,
                find_one: false,
                parent: Some(self),
            };
            let outcome =
                crate::parser::parse_one(lang, parser_id, handler, span.0, Some(span.1), opts)?;
            if outcome.matched {
                nodes.extend(outcome.nodes);
            }
        }
        Ok(nodes)
    }
}

/// Expands every capture in `nodes` (recursively) into elements. Elements
/// equal to `parent` are dropped; a capture parser re-producing its enclosing
/// element would otherwise duplicate it.
pub(crate) fn dispatch_list(
    nodes: Vec<Node>,
    lang: &LanguageParser,
    handler: &mut ContentHandler,
    parent: Option<&ContentElement>,
) -> Result<Vec<ContentElement>> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            Node::Capture(capture) => {
                let captured = capture.dispatch(lang, handler)?;
                out.extend(dispatch_list(captured, lang, handler, parent)?);
            }
            Node::Element(element) => {
                if parent.map_or(false, |p| element == *p) {
                    continue;
                }
                out.push(element);
            }
        }
    }
    Ok(out)
}

/// Child lists start out as the raw nodes a parse produced and are replaced
/// by fully expanded elements on first dispatch.
#[derive(Debug, Clone)]
pub(crate) enum Children {
    Pending(Vec<Node>),
    Resolved(Vec<ContentElement>),
}

impl Children {
    fn as_slice(&self) -> &[ContentElement] {
        match self {
            Children::Resolved(v) => v,
            Children::Pending(_) => &[],
        }
    }
}

/// Token filters for [`ContentElement::findall`]. An empty `tokens` list (or
/// the `"*"` wildcard) selects every token.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub tokens: Vec<String>,
    pub start_tokens: Vec<String>,
    pub hide_tokens: Vec<String>,
    pub stop_tokens: Vec<String>,
    /// Maximum descent depth; `None` is unlimited.
    pub depth: Option<usize>,
}

impl FindOptions {
    fn selects(&self, token: &str) -> bool {
        self.tokens.is_empty()
            || self.tokens.iter().any(|t| t == "*")
            || self.tokens.iter().any(|t| t == token)
    }
}

/// One entry of a flattened token list: starting position, covered text, and
/// the token scopes active there, outermost first.
pub type FlatToken = (Pos, String, Vec<String>);

/// A node of the parse tree. Block elements (produced by begin/end rules)
/// additionally carry the nodes of their begin and end matches.
#[derive(Debug, Clone)]
pub struct ContentElement {
    pub(crate) token: String,
    pub(crate) grammar: ParserId,
    pub(crate) content: String,
    pub(crate) span: Span,
    pub(crate) characters: BTreeMap<Pos, char>,
    pub(crate) children: Children,
    pub(crate) begin: Children,
    pub(crate) end: Children,
    pub(crate) block: bool,
}

impl PartialEq for ContentElement {
    fn eq(&self, other: &Self) -> bool {
        self.grammar == other.grammar && self.characters == other.characters
    }
}

impl ContentElement {
    pub(crate) fn new(
        token: String,
        grammar: ParserId,
        content: String,
        span: Span,
        characters: BTreeMap<Pos, char>,
        children: Vec<Node>,
    ) -> Self {
        Self {
            token,
            grammar,
            content,
            span,
            characters,
            children: Children::Pending(children),
            begin: Children::Resolved(Vec::new()),
            end: Children::Resolved(Vec::new()),
            block: false,
        }
    }

    pub(crate) fn new_block(
        token: String,
        grammar: ParserId,
        content: String,
        span: Span,
        characters: BTreeMap<Pos, char>,
        children: Vec<Node>,
        begin: Vec<Node>,
        end: Vec<Node>,
    ) -> Self {
        Self {
            token,
            grammar,
            content,
            span,
            characters,
            children: Children::Pending(children),
            begin: Children::Pending(begin),
            end: Children::Pending(end),
            block: true,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn is_block(&self) -> bool {
        self.block
    }

    /// The dispatched children. Empty until [`dispatch`](Self::dispatch) has
    /// run.
    pub fn children(&self) -> &[ContentElement] {
        self.children.as_slice()
    }

    /// The dispatched nodes of the begin match of a block element.
    pub fn begin(&self) -> &[ContentElement] {
        self.begin.as_slice()
    }

    /// The dispatched nodes of the end match of a block element.
    pub fn end(&self) -> &[ContentElement] {
        self.end.as_slice()
    }

    /// Expands the pending child nodes of this element, memoizing the result.
    /// With `nested` set the whole subtree is expanded.
    pub fn dispatch(
        &mut self,
        lang: &LanguageParser,
        handler: &mut ContentHandler,
        nested: bool,
    ) -> Result<()> {
        for field in [FieldSel::Begin, FieldSel::Children, FieldSel::End] {
            let slot = match field {
                FieldSel::Begin => &mut self.begin,
                FieldSel::Children => &mut self.children,
                FieldSel::End => &mut self.end,
            };
            if !matches!(slot, Children::Pending(_)) {
                continue;
            }
            let pending = match std::mem::replace(slot, Children::Resolved(Vec::new())) {
                Children::Pending(nodes) => nodes,
                Children::Resolved(_) => unreachable!(),
            };
            let resolved = dispatch_list(pending, lang, handler, Some(&*self))?;
            match field {
                FieldSel::Begin => self.begin = Children::Resolved(resolved),
                FieldSel::Children => self.children = Children::Resolved(resolved),
                FieldSel::End => self.end = Children::Resolved(resolved),
            }
        }
        if nested {
            for slot in [&mut self.begin, &mut self.children, &mut self.end] {
                if let Children::Resolved(elements) = slot {
                    for element in elements {
                        element.dispatch(lang, handler, true)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn descendants(&self) -> impl Iterator<Item = &ContentElement> {
        self.begin
            .as_slice()
            .iter()
            .chain(self.children.as_slice())
            .chain(self.end.as_slice())
    }

    /// Collects descendant elements by token, in document order. A
    /// `stop_tokens` hit ends the scan of its sibling run; collection starts
    /// only after a `start_tokens` hit when any are given.
    pub fn findall(&self, opts: &FindOptions) -> Vec<&ContentElement> {
        let mut found = Vec::new();
        let mut started = opts.start_tokens.is_empty();
        self.findall_into(opts, opts.depth, &mut started, &mut found);
        found
    }

    fn findall_into<'a>(
        &'a self,
        opts: &FindOptions,
        depth: Option<usize>,
        started: &mut bool,
        found: &mut Vec<&'a ContentElement>,
    ) {
        if depth == Some(0) {
            return;
        }
        for child in self.descendants() {
            if opts.stop_tokens.iter().any(|t| t == &child.token) {
                return;
            }
            if !*started && opts.start_tokens.iter().any(|t| t == &child.token) {
                *started = true;
            }
            if *started
                && opts.selects(&child.token)
                && !opts.hide_tokens.iter().any(|t| t == &child.token)
            {
                found.push(child);
            }
            child.findall_into(opts, depth.map(|d| d - 1), started, found);
        }
    }

    /// The first descendant matching `opts`, in document order.
    pub fn find(&self, opts: &FindOptions) -> Option<&ContentElement> {
        self.findall(opts).into_iter().next()
    }

    fn token_by_index(&self, map: &mut BTreeMap<Pos, Vec<String>>) {
        for pos in self.characters.keys() {
            map.entry(*pos).or_default().push(self.token.clone());
        }
        for child in self.descendants() {
            child.token_by_index(map);
        }
    }

    /// Flattens the dispatched subtree into a per-position token list:
    /// consecutive characters on one line that carry the same token scopes
    /// are merged into a single entry.
    pub fn flatten(&self) -> Vec<FlatToken> {
        let mut map: BTreeMap<Pos, Vec<String>> = BTreeMap::new();
        self.token_by_index(&mut map);

        let mut out: Vec<FlatToken> = Vec::new();
        let mut expected: Option<Pos> = None;
        for (&pos, keys) in &map {
            let c = match self.characters.get(&pos) {
                Some(c) => *c,
                None => continue,
            };
            let merge = match (out.last(), expected) {
                (Some(last), Some(exp)) => exp == pos && last.0 .0 == pos.0 && last.2 == *keys,
                _ => false,
            };
            if merge {
                out.last_mut().unwrap().1.push(c);
            } else {
                out.push((pos, c.to_string(), keys.clone()));
            }
            expected = Some(if c == '\n' {
                (pos.0 + 1, 0)
            } else {
                (pos.0, pos.1 + c.len_utf8())
            });
        }
        out
    }

    /// Serializes the dispatched subtree. Pending (undispatched) child lists
    /// serialize as absent.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("token".into(), json!(self.token));
        if self.block && !self.begin().is_empty() {
            map.insert(
                "begin".into(),
                Value::Array(self.begin().iter().map(|e| e.to_value()).collect()),
            );
        }
        if self.block && !self.end().is_empty() {
            map.insert(
                "end".into(),
                Value::Array(self.end().iter().map(|e| e.to_value()).collect()),
            );
        }
        if self.children().is_empty() {
            map.insert("content".into(), json!(self.content));
        } else {
            map.insert(
                "children".into(),
                Value::Array(self.children().iter().map(|e| e.to_value()).collect()),
            );
        }
        Value::Object(map)
    }
}

enum FieldSel {
    Begin,
    Children,
    End,
}
