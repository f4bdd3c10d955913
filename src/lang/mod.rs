//! Configuration language: lexer, parser, compound expansion
//!
//! The language is a small declarative text: element declarations
//! (`name :: Class(args)`), connections (`a [1] -> [0] b`), compound
//! classes (`elementclass Name { ... }`), `define(...)` parameters and
//! `require(...)` preconditions. Statements end at `;` or newline.
//! Every token carries a source landmark so load errors point at the
//! offending line.

mod lexer;
mod parser;

pub use lexer::{tokenize, Token, TokenKind};
pub use parser::{parse_string, ConnDecl, ElementDecl, ParsedConfig};

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A `file:line` source position, kept on every token and declaration
/// for error reporting.
#[derive(Debug, Clone)]
pub struct Landmark {
    file: Arc<String>,
    line: u32,
}

impl Landmark {
    pub fn new(file: Arc<String>, line: u32) -> Self {
        Landmark { file, line }
    }

    /// Landmark for text that did not come from a file, e.g. `-e`
    /// expressions or handler writes.
    pub fn expr() -> Self {
        Landmark {
            file: Arc::new("<config>".to_string()),
            line: 1,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{landmark}: syntax error: {msg}")]
    Syntax { landmark: Landmark, msg: String },

    #[error("{landmark}: element '{name}' declared twice")]
    Redeclared { landmark: Landmark, name: String },

    #[error("{landmark}: '{name}' is neither a declared element nor a known class")]
    Unknown { landmark: Landmark, name: String },

    #[error("{landmark}: undefined parameter '${name}'")]
    UndefinedParameter { landmark: Landmark, name: String },

    #[error("{landmark}: requirement '{what}' not satisfied")]
    Requirement { landmark: Landmark, what: String },

    #[error("{landmark}: compound '{class}' has no '{port}' pseudoport {index}")]
    BadPseudoPort {
        landmark: Landmark,
        class: String,
        port: &'static str,
        index: usize,
    },
}
