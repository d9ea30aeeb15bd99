//! Command-line front end: load a grammar document, tokenize a file or
//! stdin, and print the parse tree (or the flattened token list) as JSON.

use std::io::Read;
use std::path::PathBuf;

use clap::Parser;
use miette::IntoDiagnostic;

use tmgrammar::{Grammar, LanguageParser};

/// The CLI argument structure.
#[derive(Debug, Parser)]
#[command(
    name = "tokenize",
    version,
    about = "Tokenize text with a TextMate-style grammar."
)]
struct Args {
    /// Path to the grammar document (JSON or YAML).
    #[arg(required = true)]
    grammar: PathBuf,

    /// Input file to tokenize; reads stdin when omitted.
    input: Option<PathBuf>,

    /// Print the flattened per-position token list instead of the tree.
    #[arg(long)]
    flatten: bool,

    /// Reject input files whose extension is not in the grammar's fileTypes.
    #[arg(long)]
    check_file_type: bool,
}

fn main() -> miette::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let grammar = Grammar::from_file(&args.grammar)?;
    let language = LanguageParser::new(&grammar)?;

    let element = match &args.input {
        Some(path) if args.check_file_type => language.parse_file(path)?,
        Some(path) => {
            let content = std::fs::read_to_string(path).into_diagnostic()?;
            language.parse_document(&content)?
        }
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .into_diagnostic()?;
            language.parse_document(&content)?
        }
    };

    let value = match &element {
        Some(element) if args.flatten => serde_json::to_value(element.flatten()).into_diagnostic()?,
        Some(element) => element.to_value(),
        None => serde_json::Value::Null,
    };
    println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
    Ok(())
}
