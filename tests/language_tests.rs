//! Tests for grammar compilation: repository resolution, external scopes,
//! injections, and the document entry points.

use std::fs;

use tmgrammar::{ContentHandler, Grammar, GrammarRegistry, LanguageParser, TmError};

fn grammar(source: &str) -> Grammar {
    Grammar::from_json_str(source).unwrap()
}

fn language(source: &str) -> LanguageParser {
    LanguageParser::new(&grammar(source)).unwrap()
}

// --- Repository Resolution ---

#[test]
fn chained_bare_includes_resolve_through_the_repository() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#a"}],
            "repository": {
                "a": {"include": "#b"},
                "b": {"match": "x", "name": "tok.x"}
            }
        }"##,
    );
    let root = lang.parse_document("x").unwrap().unwrap();
    assert_eq!(root.children()[0].token(), "tok.x");
}

#[test]
fn nested_repositories_are_lifted_to_the_top_level() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#outer"}],
            "repository": {
                "outer": {
                    "patterns": [{"include": "#inner"}],
                    "repository": {
                        "inner": {"match": "y", "name": "tok.y"}
                    }
                }
            }
        }"##,
    );
    let root = lang.parse_document("y").unwrap().unwrap();
    assert_eq!(root.children()[0].token(), "tok.y");
}

#[test]
fn missing_include_fails_at_construction() {
    let g = grammar(r##"{"scopeName": "s", "patterns": [{"include": "#missing"}]}"##);
    let err = LanguageParser::new(&g).unwrap_err();
    assert!(matches!(err, TmError::UnresolvedInclude { .. }));
}

#[test]
fn cyclic_bare_includes_fail_at_construction() {
    let g = grammar(
        r##"{
            "scopeName": "s",
            "patterns": [{"include": "#a"}],
            "repository": {
                "a": {"include": "#b"},
                "b": {"include": "#a"}
            }
        }"##,
    );
    let err = LanguageParser::new(&g).unwrap_err();
    assert!(matches!(err, TmError::UnresolvedInclude { .. }));
}

// --- External Scopes ---

#[test]
fn external_scope_includes_resolve_against_the_registry() {
    let mut registry = GrammarRegistry::new();
    registry.register(grammar(
        r##"{
            "scopeName": "source.embed",
            "patterns": [{"match": "\\d+", "name": "number"}]
        }"##,
    ));
    let host = grammar(
        r##"{
            "scopeName": "source.host",
            "patterns": [{"include": "source.embed"}]
        }"##,
    );
    let lang = LanguageParser::with_registry(&host, &registry).unwrap();
    let root = lang.parse_document("42").unwrap().unwrap();
    assert_eq!(root.token(), "source.host");
    assert_eq!(root.children()[0].token(), "number");
}

#[test]
fn unknown_external_scope_fails_at_construction() {
    let host = grammar(
        r##"{"scopeName": "source.host", "patterns": [{"include": "source.embed"}]}"##,
    );
    let err = LanguageParser::new(&host).unwrap_err();
    assert!(matches!(err, TmError::UnresolvedInclude { .. }));
}

// --- Injections ---

#[test]
fn injections_apply_everywhere_except_excluded_scopes() {
    let lang = language(
        r##"{
            "scopeName": "source.inj",
            "patterns": [{"include": "#string"}],
            "repository": {
                "string": {"begin": "'", "end": "'", "name": "string.quoted", "patterns": []}
            },
            "injections": {
                "- string": {"match": "!", "name": "bang"}
            }
        }"##,
    );
    let root = lang.parse_document("a!'b!'").unwrap().unwrap();
    let tokens: Vec<_> = root.children().iter().map(|c| c.token()).collect();
    assert_eq!(tokens, ["bang", "string.quoted"]);
    // The bang inside the string scope stays plain text.
    assert!(root.children()[1].children().is_empty());
}

#[test]
fn injections_reach_non_excluded_blocks() {
    let lang = language(
        r##"{
            "scopeName": "source.inj",
            "patterns": [{"include": "#block"}],
            "repository": {
                "block": {"begin": "\\(", "end": "\\)", "name": "meta.block", "patterns": []}
            },
            "injections": {
                "- string": {"match": "!", "name": "bang"}
            }
        }"##,
    );
    let root = lang.parse_document("(!)").unwrap().unwrap();
    let block = &root.children()[0];
    assert_eq!(block.token(), "meta.block");
    assert_eq!(block.children()[0].token(), "bang");
}

#[test]
fn injections_apply_in_declaration_order() {
    // Both injections match at the same position; the first-declared one
    // wins even though its selector sorts later.
    let lang = language(
        r##"{
            "scopeName": "source.inj",
            "patterns": [],
            "injections": {
                "- zzz": {"match": "!", "name": "bang.first"},
                "- aaa": {"match": "!", "name": "bang.second"}
            }
        }"##,
    );
    let root = lang.parse_document("!").unwrap().unwrap();
    assert_eq!(root.children()[0].token(), "bang.first");
}

// --- Entry Points ---

#[test]
fn empty_documents_parse_to_none() {
    let lang = language(r##"{"scopeName": "s", "patterns": [{"match": "a", "name": "tok.a"}]}"##);
    assert!(lang.parse_document("").unwrap().is_none());
}

#[test]
fn windows_line_endings_are_normalized() {
    let lang = language(
        r##"{"scopeName": "s", "patterns": [{"match": "\\w+", "name": "word"}]}"##,
    );
    let root = lang.parse_document("a\r\nb").unwrap().unwrap();
    let spans: Vec<_> = root.children().iter().map(|c| c.span()).collect();
    assert_eq!(spans, [((0, 0), (0, 1)), ((1, 0), (1, 1))]);
}

#[test]
fn pre_processor_runs_before_parsing() {
    let mut lang = language(
        r##"{"scopeName": "s", "patterns": [{"match": "[a-z]+", "name": "word"}]}"##,
    );
    lang.set_pre_processor(|s| s.to_ascii_lowercase());
    let root = lang.parse_document("ABC").unwrap().unwrap();
    assert_eq!(root.children()[0].content(), "abc");
}

#[test]
fn parse_file_checks_the_extension_against_file_types() {
    let lang = language(
        r##"{
            "scopeName": "s",
            "fileTypes": ["demo"],
            "patterns": [{"match": "\\w+", "name": "word"}]
        }"##,
    );
    let dir = std::env::temp_dir();
    let good = dir.join("tmgrammar_language_test.demo");
    let bad = dir.join("tmgrammar_language_test.wrong");
    fs::write(&good, "hello").unwrap();
    fs::write(&bad, "hello").unwrap();

    assert!(lang.parse_file(&good).unwrap().is_some());
    assert!(matches!(
        lang.parse_file(&bad),
        Err(TmError::IncompatibleFileType { .. })
    ));

    let _ = fs::remove_file(&good);
    let _ = fs::remove_file(&bad);
}

// --- Driving Individual Parsers ---

#[test]
fn repository_parsers_can_be_driven_directly() {
    let lang = language(
        r##"{
            "scopeName": "s",
            "patterns": [{"include": "#assign"}],
            "repository": {
                "assign": {"match": "(\\w+) = (\\d+)", "name": "meta.assign"}
            }
        }"##,
    );
    let id = lang.repository_parser("assign").unwrap();
    let mut handler = ContentHandler::new("x = 1");
    let outcome = lang.parse_with(id, &mut handler, (0, 0), None).unwrap();
    assert!(outcome.matched);
    assert_eq!(outcome.span, Some(((0, 0), (0, 5))));

    assert!(lang.repository_parser("unknown").is_none());
}

#[test]
fn token_parsers_need_a_boundary() {
    let lang = language(
        r##"{
            "scopeName": "s",
            "patterns": [{"include": "#plain"}],
            "repository": {"plain": {"name": "plain.tok"}}
        }"##,
    );
    let id = lang.repository_parser("plain").unwrap();
    let mut handler = ContentHandler::new("abc");
    let err = lang.parse_with(id, &mut handler, (0, 0), None).unwrap_err();
    assert!(matches!(err, TmError::IndeterminateBoundary { .. }));
}
