//! Dynamic value model for workflow programs.
//!
//! Lists and maps are shared mutable handles: cloning a [`Value`] clones
//! the handle, so a value stored under two names aliases the same
//! storage. Deep copies are an explicit operation. Numbers keep the
//! integer/float distinction from the source document and widen only at
//! comparison and arithmetic sites.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use parking_lot::RwLock;

use super::exceptions::Exception;
use super::function::Function;
use super::symbol::SharedVariable;

/// Shared mutable list handle.
pub type ValueList = Arc<RwLock<Vec<Value>>>;
/// Shared mutable map handle. Keys are unique strings; ordering is not
/// semantically meaningful but kept stable for deterministic output.
pub type ValueMap = Arc<RwLock<BTreeMap<String, Value>>>;

/// Bookkeeping installed in every parallel branch scope: which visible
/// symbols are shared (lockable) and which are merely readable.
#[derive(Debug)]
pub struct InheritedVariables {
    pub shared: HashMap<String, bool>,
}

/// Nesting depth at which structural JSON conversion gives up. User
/// programs can alias a container into itself; conversion must not spin.
const MAX_JSON_DEPTH: usize = 128;

/// A dynamic workflow value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(ValueList),
    Map(ValueMap),
    Function(Arc<Function>),
    /// Lock-cell handle for variables shared across parallel branches.
    Shared(Arc<SharedVariable>),
    /// Opaque host handle (e.g. an event callback endpoint) threaded
    /// through workflow values by identity.
    Opaque(Arc<dyn Any + Send + Sync>),
    /// An argument position that was not supplied. Distinct from an
    /// explicit `null`.
    Omitted,
    /// Parallel-branch visibility bookkeeping; see [`InheritedVariables`].
    Inherited(Arc<InheritedVariables>),
}

impl Value {
    pub fn from_values(items: Vec<Value>) -> Value {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Value {
        Value::Map(Arc::new(RwLock::new(map)))
    }

    pub fn empty_map() -> Value {
        Value::from_map(BTreeMap::new())
    }

    pub fn function(f: Function) -> Value {
        Value::Function(Arc::new(f))
    }

    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Shared(_) => "shared variable",
            Value::Opaque(_) => "opaque handle",
            Value::Omitted => "omitted",
            Value::Inherited(_) => "inherited variables",
        }
    }

    /// Whether the value is nil-shaped for the purposes of `==`/`!=`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Null | Value::Omitted)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view, widening integers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ValueList> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Structural copy: fresh list/map storage all the way down. Scalars,
    /// functions and handles copy as themselves.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::List(items) => {
                let copied = items.read().iter().map(Value::deep_clone).collect();
                Value::from_values(copied)
            }
            Value::Map(map) => {
                let copied = map
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect();
                Value::from_map(copied)
            }
            other => other.clone(),
        }
    }

    /// Decodes a document tree. Integers without a fractional part stay
    /// integers; everything else (including 64-bit overflow) becomes a
    /// float.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::from_values(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::from_map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Structural JSON rendering. Bytes encode as base64, functions and
    /// host handles as null. Fails on pathological nesting (cycles built
    /// by mutation).
    pub fn to_json(&self) -> Result<serde_json::Value, Exception> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Result<serde_json::Value, Exception> {
        if depth > MAX_JSON_DEPTH {
            return Err(Exception::value_error(
                "value nesting is too deep (possible cycle)",
            ));
        }
        Ok(match self {
            Value::Null | Value::Omitted => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.read().len());
                for item in items.read().iter() {
                    out.push(item.to_json_at(depth + 1)?);
                }
                serde_json::Value::Array(out)
            }
            Value::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map.read().iter() {
                    out.insert(key.clone(), value.to_json_at(depth + 1)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Shared(shared) => shared.snapshot().to_json_at(depth + 1)?,
            Value::Function(_) | Value::Opaque(_) | Value::Inherited(_) => {
                serde_json::Value::Null
            }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null | Omitted, Null | Omitted) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) => (*a as f64) == *b,
            (Float(a), Int(b)) => *a == (*b as f64),
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => Arc::ptr_eq(a, b) || *a.read() == *b.read(),
            (Map(a), Map(b)) => Arc::ptr_eq(a, b) || *a.read() == *b.read(),
            (Function(a), Function(b)) => Arc::ptr_eq(a, b),
            (Shared(a), Shared(b)) => Arc::ptr_eq(a, b),
            (Opaque(a), Opaque(b)) => Arc::ptr_eq(a, b),
            (Inherited(a), Inherited(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(n) => write!(f, "Float({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::List(items) => match items.try_read() {
                Some(items) => write!(f, "List({} items)", items.len()),
                None => f.write_str("List(<locked>)"),
            },
            Value::Map(map) => match map.try_read() {
                Some(map) => write!(f, "Map({} entries)", map.len()),
                None => f.write_str("Map(<locked>)"),
            },
            Value::Function(func) => write!(f, "Function({})", func.name()),
            Value::Shared(_) => f.write_str("Shared"),
            Value::Opaque(_) => f.write_str("Opaque"),
            Value::Omitted => f.write_str("Omitted"),
            Value::Inherited(_) => f.write_str("Inherited"),
        }
    }
}
