//! Core value and runtime types shared by the expression engine and the
//! step interpreter: the dynamic [`Value`] model, the scoped
//! [`SymbolTable`], the callable [`Function`] contract, and the tagged
//! exception taxonomy.

/// Tagged exceptions and the host/workflow error split.
pub mod exceptions;
/// Callable contract with positional/optional/defaulted arguments.
pub mod function;
/// Scoped symbol table and shared (lockable) variables.
pub mod symbol;
/// Dynamic value model.
pub mod value;

pub use exceptions::{ErrorTag, Exception, RuntimeError, TaggedError};
pub use function::{Argument, Function};
pub use symbol::{
    Scope, SharedVariable, SymbolTable, INTERNAL_INHERITED_VARIABLES_SYMBOL,
};
pub use value::{InheritedVariables, Value, ValueList, ValueMap};

/// Convenience result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
