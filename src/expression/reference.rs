//! References, values and variables.
//!
//! A [`Reference`] is a not-yet-resolved path into the symbol table. It
//! resolves to a [`ResolvedValue`] for reads or a [`Variable`] for
//! writes, and carries provenance: the diagnostic path string renders
//! exactly as the source chain that produced it.

use std::fmt::Write as _;

use crate::types::{Exception, Result, SymbolTable, Value, ValueList, ValueMap};

/// One segment of a compiled path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(i64),
}

/// An unresolved path: a root symbol plus field/index steps.
#[derive(Debug, Clone)]
pub enum Reference {
    Symbol(String),
    Field {
        context: Box<Reference>,
        name: String,
        /// Whether the source wrote this access with brackets; the
        /// diagnostic path renders it back the same way.
        quoted: bool,
    },
    Index {
        context: Box<Reference>,
        index: i64,
    },
}

/// A readable snapshot with its diagnostic path.
#[derive(Debug)]
pub struct ResolvedValue {
    pub path: String,
    pub value: Value,
}

/// A writable slot with its diagnostic path.
#[derive(Debug)]
pub enum Variable {
    Symbol {
        path: String,
        name: String,
    },
    MapEntry {
        path: String,
        map: ValueMap,
        key: String,
    },
    ListEntry {
        path: String,
        list: ValueList,
        index: usize,
    },
}

impl Variable {
    pub fn path(&self) -> &str {
        match self {
            Variable::Symbol { path, .. }
            | Variable::MapEntry { path, .. }
            | Variable::ListEntry { path, .. } => path,
        }
    }

    pub fn get(&self, table: &SymbolTable) -> Value {
        match self {
            Variable::Symbol { name, .. } => table.get(name).unwrap_or(Value::Null),
            Variable::MapEntry { map, key, .. } => {
                map.read().get(key).cloned().unwrap_or(Value::Null)
            }
            Variable::ListEntry { list, index, .. } => {
                list.read().get(*index).cloned().unwrap_or(Value::Null)
            }
        }
    }

    pub fn set(&self, table: &SymbolTable, value: Value) -> Result<()> {
        match self {
            Variable::Symbol { name, .. } => table.set(name, value),
            Variable::MapEntry { map, key, .. } => {
                map.write().insert(key.clone(), value);
                Ok(())
            }
            Variable::ListEntry { list, index, .. } => {
                list.write()[*index] = value;
                Ok(())
            }
        }
    }
}

impl Reference {
    /// The root symbol of the path.
    pub fn root(&self) -> &str {
        match self {
            Reference::Symbol(name) => name,
            Reference::Field { context, .. } | Reference::Index { context, .. } => {
                context.root()
            }
        }
    }

    /// Provenance: the root symbol plus the segment chain, outermost
    /// last.
    pub fn paths(&self) -> (String, Vec<PathSegment>) {
        match self {
            Reference::Symbol(name) => (name.clone(), Vec::new()),
            Reference::Field { context, name, .. } => {
                let (root, mut segments) = context.paths();
                segments.push(PathSegment::Field(name.clone()));
                (root, segments)
            }
            Reference::Index { context, index } => {
                let (root, mut segments) = context.paths();
                segments.push(PathSegment::Index(*index));
                (root, segments)
            }
        }
    }

    /// Resolves for reading. Missing symbols are type errors, missing
    /// keys are key errors, out-of-range indexes are index errors.
    pub fn resolve_value(&self, table: &SymbolTable) -> Result<ResolvedValue> {
        match self {
            Reference::Symbol(name) => {
                let Some(value) = table.get(name) else {
                    return Err(
                        Exception::type_error(format!("not found symbol: {name}")).into()
                    );
                };
                // Reading a shared variable takes its lock for the
                // duration of the snapshot read.
                let value = match value {
                    Value::Shared(shared) => shared.snapshot(),
                    other => other,
                };
                Ok(ResolvedValue {
                    path: name.clone(),
                    value,
                })
            }
            Reference::Field {
                context,
                name,
                quoted,
            } => {
                let context = context.resolve_value(table)?;
                let path = field_path(&context.path, name, *quoted);
                let Some(map) = context.value.as_map() else {
                    return Err(Exception::type_error(format!(
                        "{path}: unexpected context type {} at {}",
                        context.value.kind(),
                        context.path
                    ))
                    .into());
                };
                let Some(value) = map.read().get(name).cloned() else {
                    return Err(Exception::key_error(format!("{path}: not found")).into());
                };
                Ok(ResolvedValue { path, value })
            }
            Reference::Index { context, index } => {
                let context = context.resolve_value(table)?;
                let path = index_path(&context.path, *index);
                let Some(list) = context.value.as_list() else {
                    return Err(Exception::type_error(format!(
                        "{path}: unexpected context type {} at {}",
                        context.value.kind(),
                        context.path
                    ))
                    .into());
                };
                let Some(value) = list.read().get(*index as usize).cloned() else {
                    return Err(Exception::index_error(format!(
                        "{path}: array index {index} out of bounds"
                    ))
                    .into());
                };
                Ok(ResolvedValue { path, value })
            }
        }
    }

    /// Resolves for writing. The context chain resolves as reads; only
    /// the final segment becomes a slot.
    pub fn resolve_variable(&self, table: &SymbolTable) -> Result<Variable> {
        match self {
            Reference::Symbol(name) => Ok(Variable::Symbol {
                path: name.clone(),
                name: name.clone(),
            }),
            Reference::Field {
                context,
                name,
                quoted,
            } => {
                let context = context.resolve_value(table)?;
                let path = field_path(&context.path, name, *quoted);
                let Some(map) = context.value.as_map() else {
                    return Err(Exception::type_error(format!(
                        "{path}: unexpected context type {} at {}",
                        context.value.kind(),
                        context.path
                    ))
                    .into());
                };
                Ok(Variable::MapEntry {
                    path,
                    map: map.clone(),
                    key: name.clone(),
                })
            }
            Reference::Index { context, index } => {
                let context = context.resolve_value(table)?;
                let path = index_path(&context.path, *index);
                let Some(list) = context.value.as_list() else {
                    return Err(Exception::type_error(format!(
                        "{path}: unexpected context type {} at {}",
                        context.value.kind(),
                        context.path
                    ))
                    .into());
                };
                let len = list.read().len();
                if *index as usize >= len {
                    return Err(Exception::index_error(format!(
                        "{path}: array index {index} out of bounds"
                    ))
                    .into());
                }
                Ok(Variable::ListEntry {
                    path,
                    list: list.clone(),
                    index: *index as usize,
                })
            }
        }
    }
}

/// Renders one field segment the way the source wrote it: bracketed
/// accesses quote, dotted accesses join with a dot (unless the name
/// needs quoting anyway).
fn field_path(context: &str, name: &str, quoted: bool) -> String {
    let safe = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap().is_ascii_digit();
    if safe && !quoted {
        format!("{context}.{name}")
    } else {
        format!("{context}[{name:?}]")
    }
}

fn index_path(context: &str, index: i64) -> String {
    let mut out = String::with_capacity(context.len() + 4);
    out.push_str(context);
    let _ = write!(out, "[{index}]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table() -> SymbolTable {
        let table = SymbolTable::default().with_frame(HashMap::new());
        let inner = Value::from_map(
            [
                ("k".to_string(), Value::from_values(vec![Value::Int(7)])),
                ("odd key".to_string(), Value::Int(1)),
            ]
            .into_iter()
            .collect(),
        );
        let outer = Value::from_map([("f".to_string(), inner)].into_iter().collect());
        table.set("sym", outer).expect("seed");
        table
    }

    fn chain() -> Reference {
        Reference::Index {
            context: Box::new(Reference::Field {
                context: Box::new(Reference::Field {
                    context: Box::new(Reference::Symbol("sym".to_string())),
                    name: "f".to_string(),
                    quoted: false,
                }),
                name: "k".to_string(),
                quoted: false,
            }),
            index: 0,
        }
    }

    #[test]
    fn path_renders_exactly_as_source() {
        let table = table();
        let resolved = chain().resolve_value(&table).expect("resolve");
        assert_eq!(resolved.path, "sym.f.k[0]");
        assert_eq!(resolved.value, Value::Int(7));
    }

    #[test]
    fn odd_field_names_always_quote() {
        assert_eq!(field_path("sym", "odd key", false), "sym[\"odd key\"]");
        assert_eq!(field_path("sym", "plain_1", false), "sym.plain_1");
        // Bracketed source accesses keep their brackets even for plain
        // names.
        assert_eq!(field_path("sym", "k", true), "sym[\"k\"]");
    }

    #[test]
    fn missing_key_is_a_key_error() {
        let table = table();
        let reference = Reference::Field {
            context: Box::new(Reference::Symbol("sym".to_string())),
            name: "nope".to_string(),
            quoted: false,
        };
        let err = reference.resolve_value(&table).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::KeyError)
        );
    }

    #[test]
    fn missing_symbol_is_a_type_error() {
        let table = table();
        let err = Reference::Symbol("ghost".to_string())
            .resolve_value(&table)
            .unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::TypeError)
        );
    }

    #[test]
    fn out_of_range_index_is_an_index_error() {
        let table = table();
        let reference = Reference::Index {
            context: Box::new(Reference::Field {
                context: Box::new(Reference::Field {
                    context: Box::new(Reference::Symbol("sym".to_string())),
                    name: "f".to_string(),
                    quoted: false,
                }),
                name: "k".to_string(),
                quoted: false,
            }),
            index: 5,
        };
        let err = reference.resolve_value(&table).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::IndexError)
        );
    }

    #[test]
    fn variables_write_through_handles() {
        let table = table();
        let variable = chain().resolve_variable(&table).expect("variable");
        variable.set(&table, Value::Int(42)).expect("set");
        let resolved = chain().resolve_value(&table).expect("resolve");
        assert_eq!(resolved.value, Value::Int(42));
    }

    #[test]
    fn roots_and_segments() {
        let (root, segments) = chain().paths();
        assert_eq!(root, "sym");
        assert_eq!(
            segments,
            vec![
                PathSegment::Field("f".to_string()),
                PathSegment::Field("k".to_string()),
                PathSegment::Index(0),
            ]
        );
    }
}
