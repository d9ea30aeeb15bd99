//! The language driver: compiles a grammar into an arena of parsers,
//! resolves its repository and injections, and runs full-document parses.
//!
//! Construction is eager and two-phase. Phase 1 compiles every rule — the
//! root pattern list, every repository entry (including repositories nested
//! anywhere in the rule tree), and every injection — into the arena,
//! recording include references symbolically. Phase 2 resolves every
//! reference to a handle: `#name` against the repository, `$self`/`$base` to
//! the owning root, and external scope names against the [`GrammarRegistry`],
//! which embeds the external grammar as an additional space of the same
//! arena. Aggregation-only pattern parsers are spliced into their includer's
//! pattern list, and eligible injections are appended last. After
//! construction the language is immutable and can be shared across parses.

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::diagnostics::{Result, TmError};
use crate::elements::{ContentElement, Node};
use crate::grammar::{Grammar, Rule};
use crate::handler::{normalize_line_endings, ContentHandler, Pos};
use crate::parser::{
    compile_rule, parse_one, ParseOpts, ParseOutcome, Parser, ParserCommon, ParserId, ParserKind,
    ParserRef,
};

/// Depth limit for chains of includes pointing at other includes.
const MAX_INCLUDE_CHAIN: usize = 64;

/// Grammars available for resolution of external scope includes.
#[derive(Debug, Default)]
pub struct GrammarRegistry {
    grammars: HashMap<String, Grammar>,
}

impl GrammarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a grammar under its scope name.
    pub fn register(&mut self, grammar: Grammar) {
        self.grammars.insert(grammar.scope_name.clone(), grammar);
    }

    pub fn get(&self, scope: &str) -> Option<&Grammar> {
        self.grammars.get(scope)
    }
}

/// A hook run over the input before the content handler is built.
pub type PreProcessor = Box<dyn Fn(&str) -> String + Send + Sync>;

/// One grammar embedded in the arena: its root parser and named repository.
struct Space {
    root: ParserId,
    repository: HashMap<String, ParserRef>,
}

/// A fully resolved language, ready to parse documents.
pub struct LanguageParser {
    name: String,
    uuid: Option<String>,
    scope_name: String,
    file_types: Vec<String>,
    arena: Vec<Parser>,
    spaces: Vec<Space>,
    /// Scope name to space index, for external grammars already embedded.
    external: HashMap<String, usize>,
    /// Exception scopes and parser of every injection, in declaration order.
    injections: Vec<(Vec<String>, ParserId)>,
    pre_processor: Option<PreProcessor>,
}

// The boxed pre-processor hook is opaque, so the derive is unavailable.
impl std::fmt::Debug for LanguageParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageParser")
            .field("name", &self.name)
            .field("scope_name", &self.scope_name)
            .field("file_types", &self.file_types)
            .field("parsers", &self.arena.len())
            .field("spaces", &self.spaces.len())
            .finish_non_exhaustive()
    }
}

impl LanguageParser {
    /// Builds a language from a grammar without external includes.
    pub fn new(grammar: &Grammar) -> Result<Self> {
        Self::with_registry(grammar, &GrammarRegistry::default())
    }

    /// Builds a language, resolving external scope includes against
    /// `registry`.
    pub fn with_registry(grammar: &Grammar, registry: &GrammarRegistry) -> Result<Self> {
        let mut lang = Self {
            name: grammar.name.clone().unwrap_or_default(),
            uuid: grammar.uuid.clone(),
            scope_name: grammar.scope_name.clone(),
            file_types: grammar.file_types.clone(),
            arena: Vec::new(),
            spaces: Vec::new(),
            external: HashMap::new(),
            injections: Vec::new(),
            pre_processor: None,
        };
        lang.add_space(grammar)?;

        let mut pending = Vec::new();
        for (selector, rule) in &grammar.injections {
            let (target, exceptions) = split_injection_selector(selector);
            if !target.is_empty() && target != lang.scope_name {
                warn!("injection target <{target}> is not this grammar, skipping");
                continue;
            }
            let key = format!("{}.injection", lang.scope_name);
            pending.push((exceptions, compile_rule(&mut lang.arena, rule, &key, false, 0)?));
        }
        // Each injection is resolved before it is added to the list, so an
        // injection's own pattern lists only receive the injections declared
        // before it.
        for (exceptions, r) in pending {
            let id = lang.resolve_ref(&r, 0, registry)?;
            lang.injections.push((exceptions, id));
        }

        lang.resolve_space(0, registry)?;
        Ok(lang)
    }

    /// Installs a hook run over every input before parsing, after line
    /// ending normalization.
    pub fn set_pre_processor(
        &mut self,
        pre_processor: impl Fn(&str) -> String + Send + Sync + 'static,
    ) {
        self.pre_processor = Some(Box::new(pre_processor));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn file_types(&self) -> &[String] {
        &self.file_types
    }

    /// The root parser handle.
    pub fn root(&self) -> ParserId {
        self.spaces[0].root
    }

    /// The resolved repository parser registered under `name`, if any.
    pub fn repository_parser(&self, name: &str) -> Option<ParserId> {
        self.spaces[0]
            .repository
            .get(name)
            .and_then(ParserRef::resolved)
    }

    pub(crate) fn parser(&self, id: ParserId) -> &Parser {
        &self.arena[id.0]
    }

    pub(crate) fn is_space_root(&self, id: ParserId) -> bool {
        self.spaces.iter().any(|space| space.root == id)
    }

    /// Parses a whole document and fully dispatches the resulting tree.
    /// Empty input parses to `None`.
    pub fn parse_document(&self, content: &str) -> Result<Option<ContentElement>> {
        if content.is_empty() {
            return Ok(None);
        }
        let normalized = normalize_line_endings(content);
        let source = match &self.pre_processor {
            Some(pre_process) => pre_process(&normalized),
            None => normalized,
        };
        let mut handler = ContentHandler::new(&source);
        self.parse_handler(&mut handler)
    }

    /// Parses a file after checking its extension against the grammar's
    /// `fileTypes`.
    pub fn parse_file(&self, path: &Path) -> Result<Option<ContentElement>> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !self.file_types.iter().any(|t| t == extension) {
            return Err(TmError::IncompatibleFileType {
                extensions: self.file_types.clone(),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        self.parse_document(&raw)
    }

    /// Runs a single parser over a prepared handler. The aggregate entry
    /// points wrap this; it is also the hook for driving individual
    /// repository parsers directly.
    pub fn parse_with(
        &self,
        id: ParserId,
        handler: &mut ContentHandler,
        starting: Pos,
        boundary: Option<Pos>,
    ) -> Result<ParseOutcome> {
        parse_one(
            self,
            id,
            handler,
            starting,
            boundary,
            ParseOpts {
                greedy: false,
                find_one: true,
                parent: None,
            },
        )
    }

    fn parse_handler(&self, handler: &mut ContentHandler) -> Result<Option<ContentElement>> {
        let outcome = parse_one(
            self,
            self.root(),
            handler,
            (0, 0),
            None,
            ParseOpts::default(),
        )?;
        if !outcome.matched {
            return Ok(None);
        }
        let root_element = outcome.nodes.into_iter().find_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Capture(_) => None,
        });
        match root_element {
            Some(mut element) => {
                element.dispatch(self, handler, true)?;
                Ok(Some(element))
            }
            None => Ok(None),
        }
    }

    /// Compiles a grammar into a new space: every repository entry (nested
    /// repositories included, later definitions overriding earlier ones) and
    /// the root pattern list.
    fn add_space(&mut self, grammar: &Grammar) -> Result<usize> {
        let space = self.spaces.len();

        let mut entries: Vec<(&String, &Rule)> = Vec::new();
        for (key, rule) in &grammar.repository {
            entries.push((key, rule));
        }
        for rule in grammar.repository.values() {
            collect_nested_repositories(rule, &mut entries);
        }
        for rule in &grammar.patterns {
            collect_nested_repositories(rule, &mut entries);
        }

        let mut repository = HashMap::new();
        for (key, rule) in entries {
            let r = compile_rule(&mut self.arena, rule, key, false, space)?;
            repository.insert(key.clone(), r);
        }

        let root_key = grammar
            .name
            .clone()
            .unwrap_or_else(|| grammar.scope_name.clone());
        let patterns = grammar
            .patterns
            .iter()
            .map(|rule| compile_rule(&mut self.arena, rule, &root_key, false, space))
            .collect::<Result<Vec<_>>>()?;

        self.arena.push(Parser {
            common: ParserCommon {
                key: root_key,
                token: Some(grammar.scope_name.clone()),
                disabled: false,
                is_capture: false,
                anchored: false,
                initialized: false,
                space,
            },
            kind: ParserKind::Patterns { patterns },
        });
        let root = ParserId(self.arena.len() - 1);
        self.spaces.push(Space { root, repository });
        Ok(space)
    }

    fn resolve_space(&mut self, space: usize, registry: &GrammarRegistry) -> Result<()> {
        let root = self.spaces[space].root;
        self.resolve_parser(root, registry)?;
        let names: Vec<String> = self.spaces[space].repository.keys().cloned().collect();
        for name in names {
            let id = self.lookup(&format!("#{name}"), space, registry, 0)?;
            self.resolve_parser(id, registry)?;
        }
        Ok(())
    }

    fn resolve_ref(&mut self, r: &ParserRef, space: usize, registry: &GrammarRegistry) -> Result<ParserId> {
        let id = match r {
            ParserRef::Resolved(id) => *id,
            ParserRef::Include(key) => self.lookup(key, space, registry, 0)?,
        };
        self.resolve_parser(id, registry)?;
        Ok(id)
    }

    /// Maps an include key to a parser handle: `$self`/`$base` to the space
    /// root, `#name` to the repository (memoizing chains of bare includes),
    /// anything else to an external grammar looked up in the registry.
    fn lookup(
        &mut self,
        key: &str,
        space: usize,
        registry: &GrammarRegistry,
        depth: usize,
    ) -> Result<ParserId> {
        if depth > MAX_INCLUDE_CHAIN {
            return Err(TmError::UnresolvedInclude {
                key: key.to_string(),
            });
        }
        if key == "$self" || key == "$base" {
            return Ok(self.spaces[space].root);
        }
        if let Some(name) = key.strip_prefix('#') {
            return match self.spaces[space].repository.get(name).cloned() {
                Some(ParserRef::Resolved(id)) => Ok(id),
                Some(ParserRef::Include(next)) => {
                    let id = self.lookup(&next, space, registry, depth + 1)?;
                    self.spaces[space]
                        .repository
                        .insert(name.to_string(), ParserRef::Resolved(id));
                    Ok(id)
                }
                None => Err(TmError::UnresolvedInclude {
                    key: key.to_string(),
                }),
            };
        }
        if let Some(&idx) = self.external.get(key) {
            return Ok(self.spaces[idx].root);
        }
        let grammar = registry.get(key).ok_or_else(|| TmError::UnresolvedInclude {
            key: key.to_string(),
        })?;
        let idx = self.add_space(grammar)?;
        self.external.insert(key.to_string(), idx);
        self.resolve_space(idx, registry)?;
        Ok(self.spaces[idx].root)
    }

    /// Resolves one parser, in four steps mirroring the pattern-list
    /// contract: includes become handles first (so cyclic includers can
    /// already see the list), then children are resolved, then
    /// aggregation-only parsers are spliced in place, and finally eligible
    /// injections are appended last.
    fn resolve_parser(&mut self, id: ParserId, registry: &GrammarRegistry) -> Result<()> {
        if self.arena[id.0].common.initialized {
            return Ok(());
        }
        self.arena[id.0].common.initialized = true;
        let space = self.arena[id.0].common.space;

        let pending = match &mut self.arena[id.0].kind {
            ParserKind::Patterns { patterns }
            | ParserKind::BeginEnd { patterns, .. }
            | ParserKind::BeginWhile { patterns, .. } => Some(std::mem::take(patterns)),
            _ => None,
        };
        if let Some(pending) = pending {
            let mut ids = Vec::new();
            for r in pending {
                ids.push(match r {
                    ParserRef::Resolved(target) => target,
                    ParserRef::Include(key) => self.lookup(&key, space, registry, 0)?,
                });
            }
            let resolved = ids.iter().map(|&t| ParserRef::Resolved(t)).collect();
            set_patterns(&mut self.arena[id.0].kind, resolved);

            for &target in &ids {
                self.resolve_parser(target, registry)?;
            }

            let mut out: Vec<ParserRef> = Vec::new();
            for &target in &ids {
                if let ParserKind::Patterns { patterns } = &self.arena[target.0].kind {
                    out.extend(patterns.iter().cloned());
                } else {
                    out.push(ParserRef::Resolved(target));
                }
            }
            out.extend(self.eligible_injections(id));
            set_patterns(&mut self.arena[id.0].kind, out);
        }

        let tables = match &mut self.arena[id.0].kind {
            ParserKind::Match { captures, .. } => vec![std::mem::take(captures)],
            ParserKind::BeginEnd {
                begin_captures,
                end_captures,
                ..
            } => vec![std::mem::take(begin_captures), std::mem::take(end_captures)],
            ParserKind::BeginWhile {
                begin_captures,
                while_captures,
                ..
            } => vec![std::mem::take(begin_captures), std::mem::take(while_captures)],
            _ => Vec::new(),
        };
        let mut resolved_tables = Vec::new();
        for table in tables {
            resolved_tables.push(self.resolve_table(table, space, registry)?);
        }
        let mut resolved_tables = resolved_tables.into_iter();
        match &mut self.arena[id.0].kind {
            ParserKind::Match { captures, .. } => {
                *captures = resolved_tables.next().unwrap_or_default();
            }
            ParserKind::BeginEnd {
                begin_captures,
                end_captures,
                ..
            } => {
                *begin_captures = resolved_tables.next().unwrap_or_default();
                *end_captures = resolved_tables.next().unwrap_or_default();
            }
            ParserKind::BeginWhile {
                begin_captures,
                while_captures,
                ..
            } => {
                *begin_captures = resolved_tables.next().unwrap_or_default();
                *while_captures = resolved_tables.next().unwrap_or_default();
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_table(
        &mut self,
        table: Vec<(usize, ParserRef)>,
        space: usize,
        registry: &GrammarRegistry,
    ) -> Result<Vec<(usize, ParserRef)>> {
        table
            .into_iter()
            .map(|(group, r)| {
                let id = self.resolve_ref(&r, space, registry)?;
                Ok((group, ParserRef::Resolved(id)))
            })
            .collect()
    }

    /// Injections apply to pattern lists of the root grammar whose owner
    /// token's leading scope component is not excluded; token-less capture
    /// parsers receive them as well.
    fn eligible_injections(&self, owner: ParserId) -> Vec<ParserRef> {
        let common = &self.arena[owner.0].common;
        if common.space != 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for (exceptions, id) in &self.injections {
            let eligible = match common.token.as_deref().filter(|t| !t.is_empty()) {
                Some(token) => {
                    let scope = token.split('.').next().unwrap_or(token);
                    !exceptions.iter().any(|e| e == scope)
                }
                None => common.is_capture,
            };
            if eligible {
                out.push(ParserRef::Resolved(*id));
            }
        }
        out
    }
}

fn set_patterns(kind: &mut ParserKind, new: Vec<ParserRef>) {
    match kind {
        ParserKind::Patterns { patterns }
        | ParserKind::BeginEnd { patterns, .. }
        | ParserKind::BeginWhile { patterns, .. } => *patterns = new,
        _ => {}
    }
}

/// Splits an injection selector into its target scope (before the first `-`)
/// and exception scopes.
fn split_injection_selector(selector: &str) -> (String, Vec<String>) {
    match selector.find('-') {
        Some(i) => {
            let target = selector[..i].trim().to_string();
            let exceptions = selector[i..]
                .split('-')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            (target, exceptions)
        }
        None => (selector.trim().to_string(), Vec::new()),
    }
}

fn collect_nested_repositories<'a>(rule: &'a Rule, out: &mut Vec<(&'a String, &'a Rule)>) {
    for (key, value) in &rule.repository {
        out.push((key, value));
    }
    for value in rule.repository.values() {
        collect_nested_repositories(value, out);
    }
    for sub in &rule.patterns {
        collect_nested_repositories(sub, out);
    }
    for sub in rule
        .captures
        .values()
        .chain(rule.begin_captures.values())
        .chain(rule.end_captures.values())
        .chain(rule.while_captures.values())
    {
        collect_nested_repositories(sub, out);
    }
}
