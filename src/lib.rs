//! Cadenza: a local emulator for a declarative cloud workflow
//! orchestration language.
//!
//! Workflow documents (YAML or JSON) compile into an immutable step
//! program; the interpreter executes it with a full expression language,
//! scoped variables, tagged exceptions, retries, and parallel iteration
//! with shared-variable locking. An optional HTTP façade emulates the
//! cloud executions API.

/// Expression language: lexer, parser, evaluator, references.
pub mod expression;
/// Optional executions-API façade.
pub mod server;
/// Standard library of built-in namespaces.
pub mod stdlib;
/// Core value, symbol-table, function and exception types.
pub mod types;
/// Document compiler and step interpreter.
pub mod workflow;

pub use expression::{Evaluator, Expr, Template};
pub use types::{
    Argument, ErrorTag, Exception, Function, RuntimeError, SymbolTable, Value,
};
pub use workflow::{CompileError, Workflow, WorkflowRoot};
