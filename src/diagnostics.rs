//! Unified diagnostic types for the tokenization engine.
//!
//! Only genuinely fatal conditions are modelled as errors: a malformed
//! grammar (unresolved include, bad regex, unsupported construct), an
//! impossible span, or a leaf parser invoked without a determinable
//! boundary. A pattern that simply fails to match is *not* an error; it is
//! reported through [`ParseOutcome::matched`](crate::parser::ParseOutcome)
//! and never aborts a document parse.

use miette::Diagnostic;
use thiserror::Error;

use crate::handler::Pos;

pub type Result<T> = std::result::Result<T, TmError>;

/// All fatal failure modes of the engine.
#[derive(Debug, Error, Diagnostic)]
pub enum TmError {
    /// An include reference could not be resolved against the repository.
    /// Detected during repository resolution, before any parsing starts.
    #[error("included parser <{key}> not found in repository")]
    #[diagnostic(code(tmgrammar::unresolved_include))]
    UnresolvedInclude { key: String },

    /// A span's closing position precedes its starting position.
    #[error("impossible span: start {start:?} does not precede close {close:?}")]
    #[diagnostic(code(tmgrammar::invalid_span))]
    InvalidSpan { start: Pos, close: Pos },

    /// A position does not address any character of the content buffer.
    #[error("position {pos:?} lies outside the content buffer")]
    #[diagnostic(code(tmgrammar::out_of_bounds))]
    OutOfBounds { pos: Pos },

    /// A plain-token parser was invoked without a boundary; there is no way
    /// to determine where its content ends.
    #[error("token parser <{key}> invoked without a parse boundary")]
    #[diagnostic(code(tmgrammar::indeterminate_boundary))]
    IndeterminateBoundary { key: String },

    /// The grammar uses a begin/while rule, which the engine deliberately
    /// does not support.
    #[error("begin/while rule <{key}> is not supported")]
    #[diagnostic(
        code(tmgrammar::unsupported),
        help("begin/while blocks are declared in the grammar schema but have no implementation; rewrite the rule as begin/end")
    )]
    Unsupported { key: String },

    /// A regular expression in the grammar failed to compile.
    #[error("invalid regular expression `{pattern}`: {message}")]
    #[diagnostic(code(tmgrammar::regex))]
    Regex { pattern: String, message: String },

    /// The input file's extension is not one of the grammar's `fileTypes`.
    #[error("input file must have extension {}", extensions.join(" / "))]
    #[diagnostic(code(tmgrammar::incompatible_file_type))]
    IncompatibleFileType { extensions: Vec<String> },

    #[error("failed to read input")]
    #[diagnostic(code(tmgrammar::io))]
    Io(#[from] std::io::Error),

    #[error("failed to decode JSON grammar")]
    #[diagnostic(code(tmgrammar::grammar_format))]
    Json(#[from] serde_json::Error),

    #[error("failed to decode YAML grammar")]
    #[diagnostic(code(tmgrammar::grammar_format))]
    Yaml(#[from] serde_yaml::Error),
}
