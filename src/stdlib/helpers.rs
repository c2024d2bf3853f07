//! Expression helpers bound at the symbol-table root: type conversion
//! and inspection functions usable anywhere an expression is.

use crate::types::{Argument, Exception, Function, Value};

use super::want_map;

pub(crate) fn functions() -> Vec<Function> {
    vec![
        Function::new("double", vec![Argument::required("attribute")], |args| {
            match &args[0] {
                Value::String(s) => s.parse::<f64>().map(Value::Float).map_err(|e| {
                    Exception::value_error(format!(
                        "cannot convert to a floating-point number: {e}"
                    ))
                    .into()
                }),
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Float(n) => Ok(Value::Float(*n)),
                other => Err(Exception::type_error(format!(
                    "the attribute is not a number or string: got {}",
                    other.kind()
                ))
                .into()),
            }
        }),
        Function::new("int", vec![Argument::required("attribute")], |args| {
            match &args[0] {
                Value::String(s) => s.parse::<i64>().map(Value::Int).map_err(|e| {
                    Exception::value_error(format!("cannot convert to an integer: {e}")).into()
                }),
                Value::Float(n) => Ok(Value::Int(*n as i64)),
                Value::Int(n) => Ok(Value::Int(*n)),
                other => Err(Exception::type_error(format!(
                    "the attribute is not a number or string: got {}",
                    other.kind()
                ))
                .into()),
            }
        }),
        Function::new("string", vec![Argument::required("attribute")], |args| {
            match &args[0] {
                Value::Int(n) => Ok(Value::String(n.to_string())),
                Value::Float(n) => Ok(Value::String(format_float(*n))),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                Value::String(s) => Ok(Value::String(s.clone())),
                other => Err(Exception::type_error(format!(
                    "attribute is not a number or boolean: got {}",
                    other.kind()
                ))
                .into()),
            }
        }),
        Function::new("keys", vec![Argument::required("attribute")], |args| {
            let map = want_map(&args[0], "attribute")?;
            let keys = map
                .read()
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect();
            Ok(Value::from_values(keys))
        }),
        Function::new("len", vec![Argument::required("attribute")], |args| {
            match &args[0] {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.read().len() as i64)),
                Value::Map(map) => Ok(Value::Int(map.read().len() as i64)),
                other => Err(Exception::type_error(format!(
                    "attribute is not a string, list or map: got {}",
                    other.kind()
                ))
                .into()),
            }
        }),
    ]
}

/// Renders without a trailing `.0` for whole floats, matching document
/// number output.
pub(crate) fn format_float(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arg: Value) -> crate::types::Result<Value> {
        let f = functions()
            .into_iter()
            .find(|f| f.name() == name)
            .expect("function");
        f.call(vec![arg])
    }

    #[test]
    fn int_coerces_strings_and_floats() {
        assert_eq!(call("int", Value::String("42".into())).unwrap(), Value::Int(42));
        assert_eq!(call("int", Value::Float(3.9)).unwrap(), Value::Int(3));
        assert!(call("int", Value::String("x".into())).is_err());
    }

    #[test]
    fn double_coerces_strings_and_ints() {
        assert_eq!(
            call("double", Value::String("2.5".into())).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(call("double", Value::Int(2)).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn string_renders_scalars() {
        assert_eq!(
            call("string", Value::Int(5)).unwrap(),
            Value::String("5".into())
        );
        assert_eq!(
            call("string", Value::Float(2.5)).unwrap(),
            Value::String("2.5".into())
        );
        assert_eq!(
            call("string", Value::Float(2.0)).unwrap(),
            Value::String("2".into())
        );
        assert_eq!(
            call("string", Value::Bool(true)).unwrap(),
            Value::String("true".into())
        );
    }

    #[test]
    fn len_counts_characters_not_bytes() {
        assert_eq!(call("len", Value::String("héllo".into())).unwrap(), Value::Int(5));
    }

    #[test]
    fn keys_lists_map_keys() {
        let map = Value::from_map(
            [("a".to_string(), Value::Int(1)), ("b".to_string(), Value::Int(2))]
                .into_iter()
                .collect(),
        );
        let keys = call("keys", map).unwrap();
        let keys = keys.as_list().unwrap().read().clone();
        assert_eq!(keys.len(), 2);
    }
}
