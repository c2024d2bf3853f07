//! Standard library exposed to workflow programs.
//!
//! Built-ins live in nested namespace maps (`http.get`, `text.split`, …)
//! assembled into a read-only root scope, with a handful of expression
//! helpers (`int`, `double`, `string`, `keys`, `len`) bound directly at
//! the root. The whole table is built once and shared by every
//! invocation.

pub(crate) mod base64;
pub(crate) mod events;
pub(crate) mod helpers;
pub(crate) mod http;
pub(crate) mod json;
pub(crate) mod list;
pub(crate) mod map;
pub(crate) mod math;
pub(crate) mod retry;
pub(crate) mod sys;
pub(crate) mod text;
pub(crate) mod time;

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;

use crate::types::{
    Exception, Function, Result, SymbolTable, Value, ValueList, ValueMap,
};

static DEFAULT_TABLE: Lazy<SymbolTable> = Lazy::new(build_default_table);

/// The read-only root table every invocation inherits: expression
/// helpers below the namespace frame.
pub fn default_symbol_table() -> SymbolTable {
    DEFAULT_TABLE.clone()
}

fn build_default_table() -> SymbolTable {
    let mut helpers = HashMap::new();
    for function in helpers::functions() {
        let name = function.name().to_string();
        helpers.insert(name, Value::function(function));
    }

    let mut namespaces = HashMap::new();
    namespaces.insert("base64".to_string(), base64::namespace());
    namespaces.insert("events".to_string(), events::namespace());
    namespaces.insert("http".to_string(), http::namespace());
    namespaces.insert("json".to_string(), json::namespace());
    namespaces.insert("list".to_string(), list::namespace());
    namespaces.insert("map".to_string(), map::namespace());
    namespaces.insert("math".to_string(), math::namespace());
    namespaces.insert("retry".to_string(), retry::namespace());
    namespaces.insert("sys".to_string(), sys::namespace());
    namespaces.insert("text".to_string(), text::namespace());
    namespaces.insert("time".to_string(), time::namespace());

    SymbolTable::default()
        .with_read_only_frame(helpers)
        .with_read_only_frame(namespaces)
}

/// Builds a namespace map from prefixed functions, keyed by the bare
/// name. Panics on a prefix mismatch or duplicate — registration bugs.
pub(crate) fn namespace_of(prefix: &str, functions: Vec<Function>) -> BTreeMap<String, Value> {
    let mut entries = BTreeMap::new();
    for function in functions {
        let name = function
            .name()
            .strip_prefix(prefix)
            .and_then(|n| n.strip_prefix('.'))
            .unwrap_or_else(|| {
                panic!(
                    "function {} does not belong to namespace {prefix}",
                    function.name()
                )
            })
            .to_string();
        let duplicate = entries.insert(name, Value::function(function));
        assert!(duplicate.is_none(), "duplicate function in {prefix}");
    }
    entries
}

// Argument coercion helpers shared by the namespace implementations.
// Built-ins receive dynamic values and classify their own mismatches.

pub(crate) fn want_string(value: &Value, what: &str) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| type_mismatch(what, "a string", value))
}

pub(crate) fn want_bytes(value: &Value, what: &str) -> Result<Vec<u8>> {
    value
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| type_mismatch(what, "bytes", value))
}

pub(crate) fn want_bool(value: &Value, what: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| type_mismatch(what, "a boolean", value))
}

pub(crate) fn want_int(value: &Value, what: &str) -> Result<i64> {
    value
        .as_int()
        .ok_or_else(|| type_mismatch(what, "an integer", value))
}

pub(crate) fn want_number(value: &Value, what: &str) -> Result<f64> {
    value
        .as_number()
        .ok_or_else(|| type_mismatch(what, "a number", value))
}

pub(crate) fn want_list(value: &Value, what: &str) -> Result<ValueList> {
    value
        .as_list()
        .cloned()
        .ok_or_else(|| type_mismatch(what, "a list", value))
}

pub(crate) fn want_map(value: &Value, what: &str) -> Result<ValueMap> {
    value
        .as_map()
        .cloned()
        .ok_or_else(|| type_mismatch(what, "a map", value))
}

/// Optional-argument view: null and omitted read as `None`.
pub(crate) fn opt<'v>(value: &'v Value) -> Option<&'v Value> {
    if value.is_nil() {
        None
    } else {
        Some(value)
    }
}

fn type_mismatch(what: &str, expected: &str, value: &Value) -> crate::types::RuntimeError {
    Exception::type_error(format!("{what} is not {expected}: got {}", value.kind())).into()
}
