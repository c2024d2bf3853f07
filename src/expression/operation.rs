//! Operation tree and operator dispatch.
//!
//! Executing an operation against a symbol table yields either a value
//! or a reference; the distinction is what makes l-values expressible.
//! Operand references are resolved to values before any arithmetic or
//! comparison runs.

use std::fmt;

use crate::types::{Exception, Result, RuntimeError, SymbolTable, Value};

use super::reference::Reference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Pos,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    /// A comma outside a call site parses but never evaluates.
    Comma,
}

impl BinaryOp {
    pub fn from_str(op: &str) -> Option<Self> {
        Some(match op {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "in" => BinaryOp::In,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "//" => BinaryOp::FloorDiv,
            "%" => BinaryOp::Mod,
            "," => BinaryOp::Comma,
            _ => return None,
        })
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Comma => ",",
        })
    }
}

/// The result of executing one operation.
#[derive(Debug)]
pub(crate) enum Evaluated {
    Value(Value),
    Reference(Reference),
}

impl Evaluated {
    /// Reads through a reference; plain values pass unchanged.
    pub fn into_value(self, table: &SymbolTable) -> Result<Value> {
        match self {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Reference(reference) => {
                Ok(reference.resolve_value(table)?.value)
            }
        }
    }
}

/// A compiled expression node.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Literal(Value),
    RetrieveSymbol(String),
    RetrieveField {
        context: Box<Operation>,
        field: Box<Operation>,
        /// Whether the access was written with brackets (`x["k"]`) as
        /// opposed to a dot (`x.k`); paths render the same way back.
        bracketed: bool,
    },
    Unary {
        op: UnaryOp,
        value: Box<Operation>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Operation>,
        right: Box<Operation>,
    },
    Call {
        function: Box<Operation>,
        args: Vec<Operation>,
    },
}

impl Operation {
    pub fn unary(op: UnaryOp, value: Operation) -> Self {
        Operation::Unary {
            op,
            value: Box::new(value),
        }
    }

    pub fn binary(op: BinaryOp, left: Operation, right: Operation) -> Self {
        Operation::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn field(context: Operation, field: Operation, bracketed: bool) -> Self {
        Operation::RetrieveField {
            context: Box::new(context),
            field: Box::new(field),
            bracketed,
        }
    }

    pub fn call(function: Operation, args: Vec<Operation>) -> Self {
        Operation::Call {
            function: Box::new(function),
            args,
        }
    }

    pub fn execute(&self, table: &SymbolTable) -> Result<Evaluated> {
        match self {
            Operation::Literal(value) => Ok(Evaluated::Value(value.clone())),

            Operation::RetrieveSymbol(name) => {
                Ok(Evaluated::Reference(Reference::Symbol(name.clone())))
            }

            Operation::RetrieveField {
                context,
                field,
                bracketed,
            } => {
                let context = context
                    .execute(table)
                    .map_err(|e| e.context("invalid context"))?;
                let field = field
                    .execute(table)
                    .map_err(|e| e.context("invalid field"))?
                    .into_value(table)?;

                let Evaluated::Reference(context) = context else {
                    return Err(Exception::type_error(format!(
                        "retrieve field {field:?}: context is not a reference"
                    ))
                    .into());
                };

                match field {
                    Value::String(name) => Ok(Evaluated::Reference(Reference::Field {
                        context: Box::new(context),
                        name,
                        quoted: *bracketed,
                    })),
                    Value::Int(index) => {
                        if index < 0 {
                            return Err(Exception::index_error(format!(
                                "array index {index} out of bounds"
                            ))
                            .into());
                        }
                        Ok(Evaluated::Reference(Reference::Index {
                            context: Box::new(context),
                            index,
                        }))
                    }
                    other => Err(Exception::type_error(format!(
                        "retrieve field: unexpected field type {}",
                        other.kind()
                    ))
                    .into()),
                }
            }

            Operation::Unary { op, value } => {
                let value = value
                    .execute(table)
                    .map_err(|e| e.context(format!("value of unary operator \"{op}\"")))?
                    .into_value(table)
                    .map_err(|e| e.context(format!("value of unary operator \"{op}\"")))?;
                execute_unary(*op, value).map(Evaluated::Value)
            }

            Operation::Binary { op, left, right } => {
                let left = left
                    .execute(table)
                    .map_err(|e| e.context(format!("left of operator \"{op}\"")))?
                    .into_value(table)
                    .map_err(|e| e.context(format!("left of operator \"{op}\"")))?;
                let right = right
                    .execute(table)
                    .map_err(|e| e.context(format!("right of operator \"{op}\"")))?
                    .into_value(table)
                    .map_err(|e| e.context(format!("right of operator \"{op}\"")))?;
                execute_binary(*op, left, right).map(Evaluated::Value)
            }

            Operation::Call { function, args } => {
                let callee = function.execute(table)?;
                let Evaluated::Reference(reference) = callee else {
                    return Err(Exception::type_error("not a function").into());
                };
                let resolved = reference.resolve_value(table)?;
                let path = resolved.path;
                let Some(function) = resolved.value.as_function().cloned() else {
                    return Err(Exception::type_error(format!("{path}: not a function")).into());
                };

                let mut values = Vec::with_capacity(args.len());
                for (i, arg) in args.iter().enumerate() {
                    let value = arg
                        .execute(table)
                        .and_then(|v| v.into_value(table))
                        .map_err(|e| e.context(format!("{path} args[{i}]")))?;
                    values.push(value);
                }

                function
                    .call(values)
                    .map(Evaluated::Value)
                    .map_err(|e| e.context(path))
            }
        }
    }
}

fn execute_unary(op: UnaryOp, value: Value) -> Result<Value> {
    match (op, &value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => Ok(value),
        (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(-n)),
        (UnaryOp::Neg, Value::Float(n)) => Ok(Value::Float(-n)),
        _ => Err(Exception::type_error(format!(
            "unknown value type for unary operator \"{op}\": {}",
            value.kind()
        ))
        .into()),
    }
}

fn execute_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    // Nil-shaped operands only ever support equality checks.
    if matches!(op, BinaryOp::Eq | BinaryOp::Ne) && (left.is_nil() || right.is_nil()) {
        let both_nil = left.is_nil() && right.is_nil();
        return Ok(Value::Bool(match op {
            BinaryOp::Eq => both_nil,
            _ => !both_nil,
        }));
    }

    match (&left, &right) {
        (Value::Bool(lhs), Value::Bool(rhs)) => match op {
            BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
            BinaryOp::And => Ok(Value::Bool(*lhs && *rhs)),
            BinaryOp::Or => Ok(Value::Bool(*lhs || *rhs)),
            _ => Err(invalid_operator(op, &left, &right)),
        },

        (Value::Bool(lhs), Value::List(rhs)) if op == BinaryOp::In => {
            let found = rhs
                .read()
                .iter()
                .any(|v| matches!(v, Value::Bool(b) if b == lhs));
            Ok(Value::Bool(found))
        }

        (Value::String(lhs), Value::String(rhs)) => match op {
            BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
            BinaryOp::Add => Ok(Value::String(format!("{lhs}{rhs}"))),
            _ => Err(invalid_operator(op, &left, &right)),
        },

        (Value::String(lhs), Value::List(rhs)) if op == BinaryOp::In => {
            let found = rhs
                .read()
                .iter()
                .any(|v| matches!(v, Value::String(s) if s == lhs));
            Ok(Value::Bool(found))
        }

        (Value::String(lhs), Value::Map(rhs)) if op == BinaryOp::In => {
            Ok(Value::Bool(rhs.read().contains_key(lhs)))
        }

        (Value::Int(lhs), Value::Int(rhs)) => execute_int_int(op, *lhs, *rhs, &left, &right),

        (Value::Int(lhs), Value::List(rhs)) if op == BinaryOp::In => {
            let found = rhs
                .read()
                .iter()
                .any(|v| matches!(v, Value::Int(n) if n == lhs));
            Ok(Value::Bool(found))
        }

        (Value::Float(lhs), Value::List(rhs)) if op == BinaryOp::In => {
            let found = rhs
                .read()
                .iter()
                .any(|v| matches!(v, Value::Float(n) if n == lhs));
            Ok(Value::Bool(found))
        }

        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            // At least one side is a float here; widen and dispatch.
            let lhs = left.as_number().unwrap();
            let rhs = right.as_number().unwrap();
            execute_float_float(op, lhs, rhs, &left, &right)
        }

        _ => Err(invalid_operator(op, &left, &right)),
    }
}

fn execute_int_int(op: BinaryOp, lhs: i64, rhs: i64, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt => Ok(Value::Bool(lhs < rhs)),
        BinaryOp::Le => Ok(Value::Bool(lhs <= rhs)),
        BinaryOp::Gt => Ok(Value::Bool(lhs > rhs)),
        BinaryOp::Ge => Ok(Value::Bool(lhs >= rhs)),
        BinaryOp::Add => Ok(Value::Int(lhs.wrapping_add(rhs))),
        BinaryOp::Sub => Ok(Value::Int(lhs.wrapping_sub(rhs))),
        BinaryOp::Mul => Ok(Value::Int(lhs.wrapping_mul(rhs))),
        BinaryOp::Div => {
            if rhs == 0 {
                Err(zero_division())
            } else {
                Ok(Value::Float(lhs as f64 / rhs as f64))
            }
        }
        BinaryOp::FloorDiv => {
            if rhs == 0 {
                Err(zero_division())
            } else {
                Ok(Value::Int(floor_div(lhs, rhs)))
            }
        }
        BinaryOp::Mod => {
            if rhs == 0 {
                Err(zero_division())
            } else {
                Ok(Value::Int(lhs.wrapping_rem(rhs)))
            }
        }
        _ => Err(invalid_operator(op, left, right)),
    }
}

fn execute_float_float(
    op: BinaryOp,
    lhs: f64,
    rhs: f64,
    left: &Value,
    right: &Value,
) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt => Ok(Value::Bool(lhs < rhs)),
        BinaryOp::Le => Ok(Value::Bool(lhs <= rhs)),
        BinaryOp::Gt => Ok(Value::Bool(lhs > rhs)),
        BinaryOp::Ge => Ok(Value::Bool(lhs >= rhs)),
        BinaryOp::Add => Ok(Value::Float(lhs + rhs)),
        BinaryOp::Sub => Ok(Value::Float(lhs - rhs)),
        BinaryOp::Mul => Ok(Value::Float(lhs * rhs)),
        BinaryOp::Div => Ok(Value::Float(lhs / rhs)),
        BinaryOp::FloorDiv => {
            if rhs == 0.0 {
                Err(zero_division())
            } else {
                Ok(Value::Int((lhs / rhs).floor() as i64))
            }
        }
        _ => Err(invalid_operator(op, left, right)),
    }
}

/// Floor division on integers, truncating toward negative infinity.
fn floor_div(lhs: i64, rhs: i64) -> i64 {
    let quotient = lhs.wrapping_div(rhs);
    if lhs.wrapping_rem(rhs) != 0 && (lhs < 0) != (rhs < 0) {
        quotient.wrapping_sub(1)
    } else {
        quotient
    }
}

fn zero_division() -> RuntimeError {
    Exception::zero_division("division by zero").into()
}

fn invalid_operator(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    Exception::type_error(format!(
        "invalid operator \"{op}\" for left={} right={}",
        left.kind(),
        right.kind()
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Value {
        Value::Int(n)
    }

    #[test]
    fn int_division_always_floats() {
        let out = execute_binary(BinaryOp::Div, int(7), int(2)).expect("divide");
        assert!(matches!(out, Value::Float(f) if f == 3.5));
        let out = execute_binary(BinaryOp::Div, int(4), int(2)).expect("divide");
        assert!(matches!(out, Value::Float(f) if f == 2.0));
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(
            execute_binary(BinaryOp::FloorDiv, int(7), int(2)).unwrap(),
            int(3)
        );
        assert_eq!(
            execute_binary(BinaryOp::FloorDiv, int(-7), int(2)).unwrap(),
            int(-4)
        );
        assert_eq!(
            execute_binary(BinaryOp::FloorDiv, int(7), int(-2)).unwrap(),
            int(-4)
        );
        let out = execute_binary(BinaryOp::FloorDiv, Value::Float(7.0), int(2)).unwrap();
        assert_eq!(out, int(3));
    }

    #[test]
    fn division_by_zero_raises() {
        for op in [BinaryOp::Div, BinaryOp::FloorDiv, BinaryOp::Mod] {
            let err = execute_binary(op, int(1), int(0)).unwrap_err();
            assert_eq!(
                err.exception().and_then(Exception::tag),
                Some(crate::types::ErrorTag::ZeroDivisionError),
                "operator {op:?}"
            );
        }
    }

    #[test]
    fn nil_equality_rules() {
        assert_eq!(
            execute_binary(BinaryOp::Eq, Value::Null, Value::Null).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            execute_binary(BinaryOp::Eq, int(1), Value::Null).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            execute_binary(BinaryOp::Ne, int(1), Value::Null).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn membership_is_typed() {
        let list = Value::from_values(vec![int(1), Value::Float(2.0), Value::Bool(true)]);
        assert_eq!(
            execute_binary(BinaryOp::In, int(1), list.clone()).unwrap(),
            Value::Bool(true)
        );
        // 2 is only present as a float; integer membership misses it.
        assert_eq!(
            execute_binary(BinaryOp::In, int(2), list.clone()).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            execute_binary(BinaryOp::In, Value::Float(2.0), list).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn string_membership_in_map_checks_keys() {
        let mut entries = std::collections::BTreeMap::new();
        entries.insert("k".to_string(), int(1));
        let map = Value::from_map(entries);
        assert_eq!(
            execute_binary(BinaryOp::In, Value::String("k".into()), map.clone()).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            execute_binary(BinaryOp::In, Value::String("x".into()), map).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn mixed_numeric_comparison_widens() {
        assert_eq!(
            execute_binary(BinaryOp::Lt, int(1), Value::Float(1.5)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            execute_binary(BinaryOp::Eq, Value::Float(3.0), int(3)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn float_modulo_is_unsupported() {
        let err = execute_binary(BinaryOp::Mod, Value::Float(1.0), int(2)).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::TypeError)
        );
    }

    #[test]
    fn string_concat_and_mismatches() {
        assert_eq!(
            execute_binary(
                BinaryOp::Add,
                Value::String("a".into()),
                Value::String("b".into())
            )
            .unwrap(),
            Value::String("ab".into())
        );
        assert!(execute_binary(BinaryOp::Add, Value::String("a".into()), int(1)).is_err());
    }

    #[test]
    fn unary_operators() {
        assert_eq!(
            execute_unary(UnaryOp::Not, Value::Bool(true)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(execute_unary(UnaryOp::Neg, int(5)).unwrap(), int(-5));
        assert!(execute_unary(UnaryOp::Neg, Value::String("x".into())).is_err());
    }
}
