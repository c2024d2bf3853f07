//! Expression language: lexer, Pratt parser, operation tree, references
//! and the evaluator.
//!
//! Expressions appear in workflow documents as `${…}` strings. They are
//! parsed eagerly at compile time into [`Expr`] values; the evaluator
//! executes them against a symbol table at run time.

/// Evaluator over operation trees and compiled document templates.
pub mod evaluator;
/// Expression scanner.
pub(crate) mod lexer;
/// Operation tree and operator dispatch.
pub(crate) mod operation;
/// Pratt parser.
pub(crate) mod parser;
/// Reference / value / variable resolution.
pub mod reference;

pub use evaluator::{Evaluator, SharedLockSet};
pub use reference::{Reference, ResolvedValue, Variable};

use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{Result as ExecResult, SymbolTable, Value};
use operation::{Evaluated, Operation};

/// Errors produced while scanning or parsing an expression source.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// A byte the scanner cannot start or continue a token with.
    #[error("invalid character {ch:?} at {position}: expr={expr:?}")]
    InvalidChar {
        ch: char,
        position: usize,
        expr: String,
    },

    /// An unterminated string literal or dangling escape.
    #[error("unbalanced literal in expr: {expr:?}")]
    Unbalanced { expr: String },

    /// A token that cannot appear where it did. Position is 1-based.
    #[error("invalid token {token:?} at {position}: expr={expr:?}")]
    InvalidToken {
        token: String,
        position: usize,
        expr: String,
    },

    /// A numeric literal that does not fit its type.
    #[error("invalid number {literal:?} at {position}: expr={expr:?}")]
    InvalidNumber {
        literal: String,
        position: usize,
        expr: String,
    },

    /// The empty source.
    #[error("empty expression is not allowed")]
    Empty,
}

/// A parsed expression: the original source (kept verbatim for
/// diagnostics) plus its compiled operation tree.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    op: Operation,
}

impl Expr {
    /// Parses an expression source (without the `${…}` delimiters).
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        parser::parse(source)
    }

    pub(crate) fn new(source: String, op: Operation) -> Self {
        Self { source, op }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression is a bare symbol.
    pub fn is_symbol(&self) -> bool {
        matches!(self.op, Operation::RetrieveSymbol(_))
    }

    /// Whether the expression is a symbol or field chain, i.e. can act as
    /// an l-value.
    pub fn can_reference(&self) -> bool {
        matches!(
            self.op,
            Operation::RetrieveSymbol(_) | Operation::RetrieveField { .. }
        )
    }

    pub(crate) fn execute(&self, table: &SymbolTable) -> ExecResult<Evaluated> {
        self.op.execute(table)
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// A compiled document fragment: scalars stay literal, `${…}` strings
/// become expressions, containers recurse.
#[derive(Debug, Clone)]
pub enum Template {
    Value(Value),
    Expr(Expr),
    List(Vec<Template>),
    Map(BTreeMap<String, Template>),
}

impl Template {
    /// Compiles a document tree, replacing every embedded-expression
    /// string with its parsed form and applying the number policy.
    pub fn compile(doc: &serde_json::Value) -> Result<Self, ParseError> {
        Ok(match doc {
            serde_json::Value::String(s) => Self::compile_string(s)?,
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Template::compile(item)?);
                }
                Template::List(out)
            }
            serde_json::Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    out.insert(key.clone(), Template::compile(value)?);
                }
                Template::Map(out)
            }
            other => Template::Value(Value::from_json(other)),
        })
    }

    /// Compiles one string: an embedded expression parses, anything else
    /// stays a literal.
    pub fn compile_string(s: &str) -> Result<Self, ParseError> {
        match trim_embedded(s) {
            Some(inner) => Ok(Template::Expr(Expr::parse(inner)?)),
            None => Ok(Template::Value(Value::String(s.to_string()))),
        }
    }
}

/// Whether the string is an embedded expression (`${…}`).
pub fn is_embedded_expr(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}')
}

/// Strips the `${…}` delimiters, or returns `None` for plain strings.
pub fn trim_embedded(s: &str) -> Option<&str> {
    if is_embedded_expr(s) {
        Some(&s[2..s.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_detection() {
        assert!(is_embedded_expr("${x + 1}"));
        assert!(!is_embedded_expr("x + 1"));
        assert!(!is_embedded_expr("${x + 1} tail"));
        assert_eq!(trim_embedded("${x}"), Some("x"));
    }

    #[test]
    fn template_compilation_splits_literals_and_exprs() {
        let doc: serde_json::Value =
            serde_json::from_str(r#"{"a": "${x + 1}", "b": "plain", "c": [1, "${y}"]}"#)
                .expect("document");
        let template = Template::compile(&doc).expect("compile");
        let Template::Map(map) = template else {
            panic!("expected map template");
        };
        assert!(matches!(map["a"], Template::Expr(_)));
        assert!(matches!(map["b"], Template::Value(Value::String(_))));
        let Template::List(items) = &map["c"] else {
            panic!("expected list template");
        };
        assert!(matches!(items[0], Template::Value(Value::Int(1))));
        assert!(matches!(items[1], Template::Expr(_)));
    }
}
