//! The grammar document model.
//!
//! A grammar is the raw, declarative form of a language definition: a tree of
//! rules with `match`/`begin`/`end` expressions, capture tables, named
//! repositories, and injections. Loading one performs no validation beyond
//! decoding; rules are checked when they are compiled into parsers by
//! [`LanguageParser`](crate::language::LanguageParser).

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::diagnostics::Result;

/// A single grammar rule, in any of its declarative shapes: a bare include, a
/// plain token, a single-expression match, a begin/end block, a begin/while
/// block, or an aggregation of sub-patterns. Which shape applies is decided
/// by which fields are populated.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub name: Option<String>,
    pub content_name: Option<String>,
    #[serde(rename = "match")]
    pub match_: Option<String>,
    pub begin: Option<String>,
    pub end: Option<String>,
    #[serde(rename = "while")]
    pub while_: Option<String>,
    pub include: Option<String>,
    pub patterns: Vec<Rule>,
    pub captures: BTreeMap<String, Rule>,
    pub begin_captures: BTreeMap<String, Rule>,
    pub end_captures: BTreeMap<String, Rule>,
    pub while_captures: BTreeMap<String, Rule>,
    pub apply_end_pattern_last: bool,
    pub disabled: bool,
    pub comment: Option<String>,
    pub repository: BTreeMap<String, Rule>,
}

/// A complete grammar document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Grammar {
    pub scope_name: String,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub file_types: Vec<String>,
    pub patterns: Vec<Rule>,
    pub repository: BTreeMap<String, Rule>,
    /// Injection selectors apply in declaration order, which breaks ties
    /// between injections matching at the same position.
    #[serde(deserialize_with = "ordered_rules", serialize_with = "rules_as_map")]
    pub injections: Vec<(String, Rule)>,
}

fn ordered_rules<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, Rule)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedRules;

    impl<'de> Visitor<'de> for OrderedRules {
        type Value = Vec<(String, Rule)>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a map of rules")
        }

        fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut out = Vec::new();
            while let Some(entry) = access.next_entry()? {
                out.push(entry);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(OrderedRules)
}

fn rules_as_map<S>(rules: &[(String, Rule)], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(rules.iter().map(|(k, v)| (k, v)))
}

impl Grammar {
    pub fn from_json_str(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Loads a grammar file, picking the format from the file extension.
    /// Unrecognized extensions are tried as JSON first, then YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Self::from_json_str(&raw).or_else(|_| Self::from_yaml_str(&raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_rule_shapes_from_json() {
        let g = Grammar::from_json_str(
            r##"{
                "scopeName": "source.demo",
                "fileTypes": ["demo"],
                "patterns": [
                    {"include": "#statement"},
                    {"match": "\\d+", "name": "constant.numeric"}
                ],
                "repository": {
                    "statement": {
                        "begin": "\\{",
                        "end": "\\}",
                        "name": "meta.block",
                        "beginCaptures": {"0": {"name": "punctuation.open"}},
                        "applyEndPatternLast": true
                    }
                }
            }"##,
        )
        .unwrap();
        assert_eq!(g.scope_name, "source.demo");
        assert_eq!(g.patterns[0].include.as_deref(), Some("#statement"));
        assert_eq!(g.patterns[1].match_.as_deref(), Some(r"\d+"));
        let stmt = &g.repository["statement"];
        assert!(stmt.apply_end_pattern_last);
        assert_eq!(
            stmt.begin_captures["0"].name.as_deref(),
            Some("punctuation.open")
        );
    }

    #[test]
    fn decodes_yaml_with_nested_repository() {
        let g = Grammar::from_yaml_str(
            r##"
scopeName: source.demo
patterns:
  - include: "#outer"
repository:
  outer:
    match: "x"
    repository:
      inner:
        match: "y"
"##,
        )
        .unwrap();
        assert_eq!(
            g.repository["outer"].repository["inner"].match_.as_deref(),
            Some("y")
        );
    }

    #[test]
    fn injections_keep_declaration_order() {
        let g = Grammar::from_json_str(
            r##"{
                "scopeName": "source.demo",
                "injections": {
                    "- zzz": {"match": "!", "name": "first"},
                    "- aaa": {"match": "!", "name": "second"}
                }
            }"##,
        )
        .unwrap();
        let names: Vec<_> = g
            .injections
            .iter()
            .map(|(_, rule)| rule.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(Grammar::from_json_str("{").is_err());
    }
}
