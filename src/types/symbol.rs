//! Scoped symbol table.
//!
//! A table is a stack of scopes, root to leaf. Scopes are shared handles:
//! child tables and shallow clones keep pointing at their parent frames,
//! so a rebind in a parent is visible to every table sharing that frame.
//! The root frames (expression helpers and the standard library) are
//! read-only; rebinding through them is a fatal invariant violation, not
//! a catchable workflow exception.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use super::exceptions::RuntimeError;
use super::value::Value;

/// Symbol under which parallel branches find their visibility
/// bookkeeping; see [`crate::types::InheritedVariables`].
pub const INTERNAL_INHERITED_VARIABLES_SYMBOL: &str = "__internal_inherited_variables";

/// One scope frame.
#[derive(Debug, Default)]
pub struct Scope {
    symbols: HashMap<String, Value>,
    read_only: bool,
}

impl Scope {
    pub fn new(symbols: HashMap<String, Value>, read_only: bool) -> Self {
        Self { symbols, read_only }
    }
}

/// Stack of scopes with read-through lookup.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    frames: Vec<Arc<RwLock<Scope>>>,
}

impl SymbolTable {
    /// Builds a table from pre-assembled frames, root first.
    pub fn from_frames(frames: Vec<Arc<RwLock<Scope>>>) -> Self {
        Self { frames }
    }

    /// Appends a read-only frame holding the given symbols.
    pub fn with_read_only_frame(mut self, symbols: HashMap<String, Value>) -> Self {
        self.frames
            .push(Arc::new(RwLock::new(Scope::new(symbols, true))));
        self
    }

    /// Appends a writable frame holding the given symbols.
    pub fn with_frame(mut self, symbols: HashMap<String, Value>) -> Self {
        self.frames
            .push(Arc::new(RwLock::new(Scope::new(symbols, false))));
        self
    }

    /// A child table sharing every frame of `self` plus a fresh writable
    /// leaf scope.
    pub fn child(&self) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Arc::new(RwLock::new(Scope::default())));
        Self { frames }
    }

    /// Copies the leaf scope's bindings into a fresh frame; parent frames
    /// stay shared.
    pub fn shallow_clone(&self) -> Self {
        let mut frames = self.frames.clone();
        if let Some(leaf) = frames.pop() {
            let leaf = leaf.read();
            frames.push(Arc::new(RwLock::new(Scope::new(
                leaf.symbols.clone(),
                leaf.read_only,
            ))));
        }
        Self { frames }
    }

    /// Looks a symbol up, leaf to root.
    pub fn get(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.read().symbols.get(name) {
                return Some(value.clone());
            }
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frames
            .iter()
            .rev()
            .any(|frame| frame.read().symbols.contains_key(name))
    }

    /// Rebinds the symbol in the nearest scope that already contains it;
    /// otherwise creates it in the nearest writable scope from the leaf.
    pub fn set(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        for frame in self.frames.iter().rev() {
            let mut scope = frame.write();
            if scope.symbols.contains_key(name) {
                if scope.read_only {
                    return Err(RuntimeError::host(format!(
                        "cannot assign to read-only symbol: {name}"
                    )));
                }
                scope.symbols.insert(name.to_string(), value);
                return Ok(());
            }
        }
        for frame in self.frames.iter().rev() {
            let mut scope = frame.write();
            if !scope.read_only {
                scope.symbols.insert(name.to_string(), value);
                return Ok(());
            }
        }
        Err(RuntimeError::host(format!(
            "no writable scope to bind symbol: {name}"
        )))
    }

    /// Creates or rebinds the symbol in the leaf scope only, shadowing
    /// any outer binding. Used for loop variables, exception bindings and
    /// invocation parameters.
    pub fn define(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let Some(frame) = self.frames.last() else {
            return Err(RuntimeError::host(format!(
                "no scope to bind symbol: {name}"
            )));
        };
        let mut scope = frame.write();
        if scope.read_only {
            return Err(RuntimeError::host(format!(
                "cannot assign to read-only symbol: {name}"
            )));
        }
        scope.symbols.insert(name.to_string(), value);
        Ok(())
    }

    /// Every visible symbol, streamed root to leaf without duplicates.
    pub fn keys(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for frame in &self.frames {
            for key in frame.read().symbols.keys() {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }
}

/// A lock-cell around a value, used to let parallel branches mutate one
/// variable safely. The lock guard owns its handle so it can be held
/// across the swap-in/swap-back window.
pub struct SharedVariable {
    slot: Arc<Mutex<Value>>,
}

impl SharedVariable {
    pub fn new(value: Value) -> Self {
        Self {
            slot: Arc::new(Mutex::new(value)),
        }
    }

    /// Exclusive lock over the stored value.
    pub fn lock(&self) -> ArcMutexGuard<RawMutex, Value> {
        Mutex::lock_arc(&self.slot)
    }

    /// Momentary read of the stored value.
    pub fn snapshot(&self) -> Value {
        self.slot.lock().clone()
    }
}

impl std::fmt::Debug for SharedVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedVariable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_root() -> SymbolTable {
        let mut root = HashMap::new();
        root.insert("builtin".to_string(), Value::Int(1));
        SymbolTable::default()
            .with_read_only_frame(root)
            .with_frame(HashMap::new())
    }

    #[test]
    fn get_walks_to_the_root() {
        let table = table_with_root();
        assert_eq!(table.get("builtin"), Some(Value::Int(1)));
        assert_eq!(table.get("missing"), None);
    }

    #[test]
    fn set_rebinds_nearest_containing_scope() {
        let table = table_with_root();
        table.set("x", Value::Int(1)).expect("create");
        let child = table.child();
        child.set("x", Value::Int(2)).expect("rebind");
        // The rebind went to the parent scope, not the child leaf.
        assert_eq!(table.get("x"), Some(Value::Int(2)));
    }

    #[test]
    fn define_shadows_in_the_leaf() {
        let table = table_with_root();
        table.set("x", Value::Int(1)).expect("create");
        let child = table.child();
        child.define("x", Value::Int(9)).expect("shadow");
        assert_eq!(child.get("x"), Some(Value::Int(9)));
        assert_eq!(table.get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn read_only_root_rejects_rebinds() {
        let table = table_with_root();
        let err = table.set("builtin", Value::Int(2)).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn shallow_clone_detaches_the_leaf_only() {
        let table = table_with_root();
        table.set("x", Value::Int(1)).expect("create");
        let clone = table.shallow_clone();
        clone.define("x", Value::Int(5)).expect("rebind in clone");
        assert_eq!(table.get("x"), Some(Value::Int(1)));
        assert_eq!(clone.get("x"), Some(Value::Int(5)));
    }

    #[test]
    fn keys_stream_root_to_leaf() {
        let table = table_with_root();
        table.set("x", Value::Int(1)).expect("create");
        let keys = table.keys();
        assert_eq!(keys, ["builtin", "x"]);
    }
}
