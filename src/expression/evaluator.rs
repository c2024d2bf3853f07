//! Expression evaluator.
//!
//! Binds a symbol table and executes compiled expressions and document
//! templates against it. Also owns the shared-variable lock discipline
//! used by assignments inside parallel branches: acquire the exclusive
//! lock, swap the live value into the table, run the mutation, swap the
//! updated value back and release — in reverse acquisition order when
//! several variables are involved.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::types::{
    Result, RuntimeError, SharedVariable, SymbolTable, Value,
    INTERNAL_INHERITED_VARIABLES_SYMBOL,
};

use super::operation::Evaluated;
use super::reference::Reference;
use super::{Expr, Template};

/// Evaluator bound to one symbol table.
#[derive(Debug, Clone)]
pub struct Evaluator {
    pub symbol_table: SymbolTable,
}

/// A template with every embedded expression resolved to a reference
/// instead of a value; the l-value analogue of template evaluation.
#[derive(Debug)]
pub enum ResolvedTemplate {
    Value(Value),
    Reference(Reference),
    List(Vec<ResolvedTemplate>),
    Map(BTreeMap<String, ResolvedTemplate>),
}

impl Evaluator {
    pub fn new(symbol_table: SymbolTable) -> Self {
        Self { symbol_table }
    }

    /// Evaluates an expression to a plain value, reading through any
    /// resulting reference.
    pub fn evaluate_value(&self, expr: &Expr) -> Result<Value> {
        expr.execute(&self.symbol_table)?
            .into_value(&self.symbol_table)
    }

    /// Evaluates a compiled document fragment: expression leaves
    /// evaluate, containers rebuild with fresh storage, literals pass
    /// through.
    pub fn evaluate_template(&self, template: &Template) -> Result<Value> {
        match template {
            Template::Value(value) => Ok(value.clone()),
            Template::Expr(expr) => self.evaluate_value(expr),
            Template::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(
                        self.evaluate_template(item)
                            .map_err(|e| e.context(format!("index={i}")))?,
                    );
                }
                Ok(Value::from_values(out))
            }
            Template::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    out.insert(
                        key.clone(),
                        self.evaluate_template(value)
                            .map_err(|e| e.context(format!("key={key:?}")))?,
                    );
                }
                Ok(Value::from_map(out))
            }
        }
    }

    /// Executes an expression expecting a reference (an l-value shape).
    pub fn resolve_reference(&self, expr: &Expr) -> Result<Reference> {
        match expr.execute(&self.symbol_table)? {
            Evaluated::Reference(reference) => Ok(reference),
            Evaluated::Value(_) => Err(RuntimeError::host(format!(
                "{:?} is not a valid reference",
                expr.source()
            ))),
        }
    }

    /// The reference-shaped analogue of [`Self::evaluate_template`]:
    /// expression leaves resolve to references, everything else passes
    /// through.
    pub fn resolve_reference_template(&self, template: &Template) -> Result<ResolvedTemplate> {
        match template {
            Template::Value(value) => Ok(ResolvedTemplate::Value(value.clone())),
            Template::Expr(expr) => Ok(ResolvedTemplate::Reference(self.resolve_reference(expr)?)),
            Template::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(
                        self.resolve_reference_template(item)
                            .map_err(|e| e.context(format!("index={i}")))?,
                    );
                }
                Ok(ResolvedTemplate::List(out))
            }
            Template::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    out.insert(
                        key.clone(),
                        self.resolve_reference_template(value)
                            .map_err(|e| e.context(format!("key={key:?}")))?,
                    );
                }
                Ok(ResolvedTemplate::Map(out))
            }
        }
    }

    /// Prepares the shared-variable locks needed to write through the
    /// given l-value expressions. Outside a parallel branch this is a
    /// no-op. Inside one, writing to a visible-but-unshared root is an
    /// error; shared roots are locked and their live values swapped into
    /// the table until the returned set unwinds.
    pub fn lock_shared_if_needed(&self, exprs: &[&Expr]) -> Result<SharedLockSet> {
        let Some(inherited) = self.symbol_table.get(INTERNAL_INHERITED_VARIABLES_SYMBOL) else {
            return Ok(SharedLockSet::empty());
        };
        let Value::Inherited(inherited) = inherited else {
            return Err(RuntimeError::host(
                "internal inherited-variables symbol holds an unexpected value",
            ));
        };

        let mut locked_roots = HashSet::new();
        let mut set = SharedLockSet {
            table: self.symbol_table.clone(),
            locks: Vec::new(),
        };
        for expr in exprs {
            let reference = self.resolve_reference(expr)?;
            let root = reference.root().to_string();
            match inherited.shared.get(&root) {
                Some(true) => {
                    if !locked_roots.insert(root.clone()) {
                        continue;
                    }
                    let Some(Value::Shared(shared)) = self.symbol_table.get(&root) else {
                        return Err(RuntimeError::host(format!(
                            "shared variable is not lockable: {root}"
                        )));
                    };
                    let guard = shared.lock();
                    self.symbol_table.set(&root, Value::clone(&guard))?;
                    set.locks.push(HeldLock {
                        root,
                        shared,
                        guard: Some(guard),
                    });
                }
                Some(false) => {
                    return Err(RuntimeError::host(format!(
                        "cannot assign to non-shared variable in parallel step: {root}"
                    )));
                }
                // Created inside this branch; plain local write.
                None => {}
            }
        }
        Ok(set)
    }
}

struct HeldLock {
    root: String,
    shared: Arc<SharedVariable>,
    guard: Option<ArcMutexGuard<RawMutex, Value>>,
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("root", &self.root)
            .field("shared", &self.shared)
            .finish()
    }
}

/// Held shared-variable locks. Unwinding swaps each updated value back
/// into its lock cell and releases, in reverse acquisition order.
#[derive(Debug)]
pub struct SharedLockSet {
    table: SymbolTable,
    locks: Vec<HeldLock>,
}

impl SharedLockSet {
    fn empty() -> Self {
        Self {
            table: SymbolTable::default(),
            locks: Vec::new(),
        }
    }
}

impl Drop for SharedLockSet {
    fn drop(&mut self) {
        for lock in self.locks.drain(..).rev() {
            let Some(mut guard) = lock.guard else {
                continue;
            };
            if let Some(updated) = self.table.get(&lock.root) {
                *guard = updated;
            }
            let _ = self
                .table
                .set(&lock.root, Value::Shared(lock.shared.clone()));
            drop(guard);
        }
    }
}
