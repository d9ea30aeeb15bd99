//! End-to-end parses of small grammars, covering the match, aggregation and
//! begin/end state machines.

use tmgrammar::{ContentElement, Grammar, LanguageParser, TmError};

fn language(grammar: &str) -> LanguageParser {
    LanguageParser::new(&Grammar::from_json_str(grammar).unwrap()).unwrap()
}

fn tokens(element: &ContentElement) -> Vec<&str> {
    element.children().iter().map(|c| c.token()).collect()
}

// --- Match Rules ---

#[test]
fn match_rule_produces_an_element_with_capture_children() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#assign"}],
            "repository": {
                "assign": {
                    "match": "(\\w+) = (\\d+)",
                    "name": "meta.assign",
                    "captures": {
                        "1": {"name": "variable"},
                        "2": {"name": "constant.numeric"}
                    }
                }
            }
        }"##,
    );
    let root = lang.parse_document("x = 42").unwrap().unwrap();
    assert_eq!(root.token(), "source.test");

    let assign = &root.children()[0];
    assert_eq!(assign.token(), "meta.assign");
    assert_eq!(assign.content(), "x = 42");
    assert_eq!(assign.span(), ((0, 0), (0, 6)));
    let kids: Vec<_> = assign
        .children()
        .iter()
        .map(|c| (c.token(), c.content()))
        .collect();
    assert_eq!(kids, [("variable", "x"), ("constant.numeric", "42")]);
}

#[test]
fn non_participating_capture_groups_are_skipped() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{
                "match": "(a)|(b)",
                "name": "alt",
                "captures": {"1": {"name": "tok.a"}, "2": {"name": "tok.b"}}
            }]
        }"##,
    );
    let root = lang.parse_document("b").unwrap().unwrap();
    let alt = &root.children()[0];
    assert_eq!(tokens(alt), ["tok.b"]);
}

// --- Aggregation ---

#[test]
fn aggregation_prefers_strict_declaration_order() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [
                {"match": "a", "name": "tok.a"},
                {"match": "b", "name": "tok.b"}
            ]
        }"##,
    );
    // Declaration order decides only among rules matching without leading
    // characters; "b" sits at the scan position, "a" does not.
    let root = lang.parse_document("b a").unwrap().unwrap();
    assert_eq!(tokens(&root), ["tok.b", "tok.a"]);
}

#[test]
fn relaxed_round_picks_the_earliest_match() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [
                {"match": "a", "name": "tok.a"},
                {"match": "b", "name": "tok.b"}
            ]
        }"##,
    );
    // Nothing matches at the scan position, so the relaxed round runs and
    // the earlier match wins regardless of declaration order.
    let root = lang.parse_document("c a b").unwrap().unwrap();
    assert_eq!(tokens(&root), ["tok.a", "tok.b"]);
}

#[test]
fn anchored_rule_only_matches_at_the_previous_match_end() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [
                {"match": "\\Gb", "name": "anchored.b"},
                {"match": "a", "name": "tok.a"}
            ]
        }"##,
    );
    let root = lang.parse_document("ab").unwrap().unwrap();
    assert_eq!(tokens(&root), ["tok.a", "anchored.b"]);
}

#[test]
fn unparseable_lines_are_skipped_at_the_root() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"match": "[a-z]+", "name": "word"}]
        }"##,
    );
    let root = lang.parse_document("???\nfoo").unwrap().unwrap();
    let words: Vec<_> = root.children().iter().map(|c| c.content()).collect();
    assert_eq!(words, ["foo"]);
}

// --- Begin/End Blocks ---

#[test]
fn begin_end_block_carries_begin_and_end_captures() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#string"}],
            "repository": {
                "string": {
                    "begin": "\"",
                    "end": "\"",
                    "contentName": "string.content",
                    "beginCaptures": {"0": {"name": "punctuation.open"}},
                    "endCaptures": {"0": {"name": "punctuation.close"}}
                }
            }
        }"##,
    );
    let root = lang.parse_document("\"hi\"").unwrap().unwrap();
    let string = &root.children()[0];
    assert!(string.is_block());
    // contentName: the element covers only the text between the delimiters.
    assert_eq!(string.token(), "string.content");
    assert_eq!(string.content(), "hi");
    assert_eq!(string.span(), ((0, 1), (0, 3)));
    assert_eq!(string.begin()[0].token(), "punctuation.open");
    assert_eq!(string.end()[0].token(), "punctuation.close");
    assert!(string.children().is_empty());
}

#[test]
fn unclosed_block_closes_at_the_boundary() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"begin": "\\{", "end": "\\}", "name": "meta.block"}]
        }"##,
    );
    let root = lang.parse_document("{abc").unwrap().unwrap();
    let block = &root.children()[0];
    assert_eq!(block.token(), "meta.block");
    assert_eq!(block.content(), "{abc");
    assert!(block.end().is_empty());
}

#[test]
fn nested_blocks_via_self_include() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [
                {"include": "#paren"},
                {"match": "\\w+", "name": "word"}
            ],
            "repository": {
                "paren": {
                    "begin": "\\(",
                    "end": "\\)",
                    "name": "meta.paren",
                    "patterns": [{"include": "$self"}]
                }
            }
        }"##,
    );
    let root = lang.parse_document("( (a) )").unwrap().unwrap();
    let outer = &root.children()[0];
    assert_eq!(outer.token(), "meta.paren");
    assert_eq!(outer.content(), "( (a) )");
    let inner = &outer.children()[0];
    assert_eq!(inner.token(), "meta.paren");
    assert_eq!(inner.content(), "(a)");
    assert_eq!(tokens(inner), ["word"]);
}

#[test]
fn apply_end_pattern_last_gives_patterns_priority_on_ties() {
    let with_flag = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{
                "begin": "\\[", "end": "\\]", "name": "meta.brackets",
                "applyEndPatternLast": true,
                "patterns": [{"match": "\\]", "name": "esc.bracket"}]
            }]
        }"##,
    );
    let root = with_flag.parse_document("[]").unwrap().unwrap();
    assert_eq!(tokens(&root.children()[0]), ["esc.bracket"]);

    let without_flag = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{
                "begin": "\\[", "end": "\\]", "name": "meta.brackets",
                "patterns": [{"match": "\\]", "name": "esc.bracket"}]
            }]
        }"##,
    );
    let root = without_flag.parse_document("[]").unwrap().unwrap();
    assert!(root.children()[0].children().is_empty());
}

#[test]
fn implicitly_closed_block_drops_deprioritized_end_captures() {
    // The end pattern matches in the first round but loses the tie to the
    // sub-pattern; the block then runs out of input and closes implicitly.
    // Its end captures must not survive from the losing round.
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{
                "begin": "\\[", "end": "\\]", "name": "meta.brackets",
                "applyEndPatternLast": true,
                "endCaptures": {"0": {"name": "punctuation.close"}},
                "patterns": [{"match": "\\]", "name": "esc.bracket"}]
            }]
        }"##,
    );
    let root = lang.parse_document("[]").unwrap().unwrap();
    let block = &root.children()[0];
    assert_eq!(tokens(block), ["esc.bracket"]);
    assert!(block.end().is_empty());
}

// --- Error Channel ---

#[test]
fn begin_while_rules_are_rejected_at_parse_time() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#cont"}],
            "repository": {
                "cont": {"begin": ">", "while": ">", "name": "markup.quote"}
            }
        }"##,
    );
    let err = lang.parse_document("> quoted").unwrap_err();
    assert!(matches!(err, TmError::Unsupported { .. }));
}

#[test]
fn capture_recursion_terminates() {
    // The capture table of the rule points back at the rule itself; the
    // second-level dispatch covers the same span and must be cut off.
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [{"include": "#rule"}],
            "repository": {
                "rule": {
                    "match": "(x+)",
                    "name": "meta.x",
                    "captures": {"1": {"include": "#rule"}}
                }
            }
        }"##,
    );
    let root = lang.parse_document("x").unwrap().unwrap();
    let m = &root.children()[0];
    assert_eq!(m.token(), "meta.x");
    assert!(m.children().is_empty());
}

#[test]
fn disabled_rules_do_not_participate() {
    let lang = language(
        r##"{
            "scopeName": "source.test",
            "patterns": [
                {"match": "a", "name": "tok.a", "disabled": true},
                {"match": "a", "name": "tok.other"}
            ]
        }"##,
    );
    let root = lang.parse_document("a").unwrap().unwrap();
    assert_eq!(tokens(&root), ["tok.other"]);
}
