pub use crate::diagnostics::{Result, TmError};
pub use crate::elements::{Capture, ContentElement, FindOptions, FlatToken, Node};
pub use crate::grammar::{Grammar, Rule};
pub use crate::handler::{ContentHandler, Matching, Pos, Span, MAX_LOOKBEHIND};
pub use crate::language::{GrammarRegistry, LanguageParser, PreProcessor};
pub use crate::parser::{ParseOpts, ParseOutcome, ParserId};
pub use crate::pattern::Pattern;

pub mod diagnostics;
pub mod elements;
pub mod grammar;
pub mod handler;
pub mod language;
pub mod parser;
pub mod pattern;
