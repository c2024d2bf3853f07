//! `retry.*` built-ins: trivial predicates plus the default backoff
//! shape shared with the HTTP retry bundles.

use std::collections::BTreeMap;

use crate::types::{Argument, Function, Value};

pub(crate) fn default_backoff() -> Value {
    let mut backoff = BTreeMap::new();
    backoff.insert("initial_delay".to_string(), Value::Float(1.0));
    backoff.insert("max_delay".to_string(), Value::Float(60.0));
    backoff.insert("multiplier".to_string(), Value::Float(2.0));
    Value::from_map(backoff)
}

pub(crate) fn namespace() -> Value {
    let mut entries = BTreeMap::new();
    entries.insert("default_backoff".to_string(), default_backoff());
    entries.insert(
        "always".to_string(),
        Value::function(Function::raw(
            "retry.always",
            vec![Argument::required("exception")],
            |_| Ok(Value::Bool(true)),
        )),
    );
    entries.insert(
        "never".to_string(),
        Value::function(Function::raw(
            "retry.never",
            vec![Argument::required("exception")],
            |_| Ok(Value::Bool(false)),
        )),
    );
    Value::from_map(entries)
}
