//! Uniform callable contract for built-ins and sub-workflows.
//!
//! Every callable carries an ordered argument descriptor list. The
//! checked flavor windows the provided arity, substitutes defaults for
//! missing or omitted positions (deep-cloning container defaults so
//! calls cannot leak state into the descriptor) and fills optional
//! positions with null. The raw flavor substitutes omitted positions
//! only and hands the vector through; callees that window themselves
//! (sub-workflow invocations, retry predicates) use it.

use std::fmt::Write as _;

use super::exceptions::RuntimeError;
use super::value::Value;
use super::Result;

/// One argument descriptor. `default` and `optional` are mutually
/// exclusive.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub default: Option<Value>,
    pub optional: bool,
}

impl Argument {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            optional: false,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            optional: true,
        }
    }
}

type NativeFn = Box<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

enum Flavor {
    Checked,
    Raw,
}

/// A callable value.
pub struct Function {
    name: String,
    args: Vec<Argument>,
    min_args: usize,
    flavor: Flavor,
    native: NativeFn,
}

impl Function {
    /// Checked flavor: arity window, default substitution, optional
    /// filling. Panics if a descriptor sets both `default` and
    /// `optional` — that is a registration bug, not an input error.
    pub fn new(
        name: impl Into<String>,
        args: Vec<Argument>,
        native: impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::build(name.into(), args, Flavor::Checked, Box::new(native))
    }

    /// Raw flavor: omitted-argument substitution only.
    pub fn raw(
        name: impl Into<String>,
        args: Vec<Argument>,
        native: impl Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::build(name.into(), args, Flavor::Raw, Box::new(native))
    }

    fn build(name: String, args: Vec<Argument>, flavor: Flavor, native: NativeFn) -> Self {
        for (i, arg) in args.iter().enumerate() {
            assert!(
                !(arg.default.is_some() && arg.optional),
                "{name}: argument[{i}] {} cannot be optional and have a default",
                arg.name
            );
        }
        let min_args = args
            .iter()
            .take_while(|a| a.default.is_none() && !a.optional)
            .count();
        Self {
            name,
            args,
            min_args,
            flavor,
            native,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Declared parameter names, in order. Named call arguments splat in
    /// this order.
    pub fn arg_names(&self) -> Vec<&str> {
        self.args.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        match self.flavor {
            Flavor::Checked => self.call_checked(args),
            Flavor::Raw => self.call_raw(args),
        }
    }

    fn call_checked(&self, provided: Vec<Value>) -> Result<Value> {
        if provided.len() > self.args.len() {
            return Err(RuntimeError::host(format!(
                "too many arguments: {} arguments are allowed but got {}, usage: {}",
                self.args.len(),
                provided.len(),
                self.usage()
            )));
        }
        if provided.len() < self.min_args {
            return Err(RuntimeError::host(format!(
                "missing arguments: {} arguments are required but got {}, usage: {}",
                self.min_args,
                provided.len(),
                self.usage()
            )));
        }

        let mut provided = provided.into_iter();
        let mut filled = Vec::with_capacity(self.args.len());
        for (i, arg) in self.args.iter().enumerate() {
            let value = provided.next();
            let omitted = matches!(&value, None | Some(Value::Omitted));
            if omitted {
                if let Some(default) = &arg.default {
                    filled.push(Self::clone_default(default));
                } else if arg.optional {
                    filled.push(Value::Null);
                } else {
                    return Err(RuntimeError::host(format!(
                        "missing argument[{i}] {}, usage: {}",
                        arg.name,
                        self.usage()
                    )));
                }
            } else {
                filled.push(value.unwrap());
            }
        }
        (self.native)(filled)
    }

    fn call_raw(&self, provided: Vec<Value>) -> Result<Value> {
        if provided.len() > self.args.len() {
            return Err(RuntimeError::host(format!(
                "invalid function usage: {}",
                self.usage()
            )));
        }
        let mut args: Vec<Value> = provided
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Value::Omitted => {
                    let def = &self.args[i];
                    if def.optional {
                        Value::Null
                    } else if let Some(default) = &def.default {
                        default.clone()
                    } else {
                        Value::Omitted
                    }
                }
                other => other,
            })
            .collect();
        while args.len() < self.args.len() {
            let def = &self.args[args.len()];
            if def.optional {
                break;
            }
            args.push(def.default.clone().unwrap_or(Value::Null));
        }
        (self.native)(args)
    }

    /// Container defaults are deep-cloned so one call's mutation cannot
    /// leak into the next.
    fn clone_default(default: &Value) -> Value {
        match default {
            Value::List(_) | Value::Map(_) => default.deep_clone(),
            other => other.clone(),
        }
    }

    fn usage(&self) -> String {
        let mut s = String::new();
        s.push_str(&self.name);
        s.push('(');
        for (i, arg) in self.args.iter().enumerate() {
            if i != 0 {
                s.push_str(", ");
            }
            s.push_str(&arg.name);
            if arg.optional {
                s.push('?');
            } else if let Some(default) = &arg.default {
                match default.to_json() {
                    Ok(json) => {
                        let _ = write!(s, " = {json}");
                    }
                    Err(_) => s.push_str(" = …"),
                }
            }
        }
        s.push(')');
        s
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Function({})", self.usage())
    }
}
