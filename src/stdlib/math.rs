//! `math.*` built-ins. Integer pairs stay integers; mixed operands widen
//! to floats.

use crate::types::{Argument, Exception, Function, Value};

use super::namespace_of;

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "math",
        vec![
            Function::new("math.abs", vec![Argument::required("x")], |args| {
                match &args[0] {
                    Value::Int(n) => {
                        if *n == i64::MIN {
                            Err(Exception::value_error(format!(
                                "absolute value of {n} does not fit in an integer"
                            ))
                            .into())
                        } else {
                            Ok(Value::Int(n.abs()))
                        }
                    }
                    Value::Float(n) => Ok(Value::Float(n.abs())),
                    other => Err(not_a_number("x", other)),
                }
            }),
            Function::new(
                "math.max",
                vec![Argument::required("x"), Argument::required("y")],
                |args| pick(&args[0], &args[1], true),
            ),
            Function::new(
                "math.min",
                vec![Argument::required("x"), Argument::required("y")],
                |args| pick(&args[0], &args[1], false),
            ),
        ],
    ))
}

fn pick(x: &Value, y: &Value, want_max: bool) -> crate::types::Result<Value> {
    match (x, y) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(if want_max {
            *a.max(b)
        } else {
            *a.min(b)
        })),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = x.as_number().unwrap();
            let b = y.as_number().unwrap();
            Ok(Value::Float(if want_max { a.max(b) } else { a.min(b) }))
        }
        (Value::Int(_) | Value::Float(_), other) => Err(not_a_number("y", other)),
        (other, _) => Err(not_a_number("x", other)),
    }
}

fn not_a_number(what: &str, value: &Value) -> crate::types::RuntimeError {
    Exception::type_error(format!(
        "{what} is not an integer or floating-point number: got {}",
        value.kind()
    ))
    .into()
}
