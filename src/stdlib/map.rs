//! `map.*` built-ins.

use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, opt};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "map",
        vec![Function::new(
            "map.get",
            vec![Argument::optional("map"), Argument::required("keys")],
            |args| {
                let Some(map) = opt(&args[0]) else {
                    return Ok(Value::Null);
                };
                let keys = match &args[1] {
                    Value::String(s) => vec![s.clone()],
                    Value::List(items) => {
                        let mut keys = Vec::with_capacity(items.read().len());
                        for item in items.read().iter() {
                            match item {
                                Value::String(s) => keys.push(s.clone()),
                                _ => {
                                    return Err(Exception::type_error(
                                        "keys must be a string or string list",
                                    )
                                    .into())
                                }
                            }
                        }
                        keys
                    }
                    _ => {
                        return Err(
                            Exception::type_error("keys must be a string or string list").into()
                        )
                    }
                };

                let mut current = map.clone();
                for key in keys {
                    let Some(next) = current.as_map() else {
                        return Ok(Value::Null);
                    };
                    let entry = next.read().get(&key).cloned();
                    match entry {
                        Some(value) => current = value,
                        None => return Ok(Value::Null),
                    }
                }
                Ok(current)
            },
        )],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let inner = Value::from_map([("b".to_string(), Value::Int(7))].into_iter().collect());
        Value::from_map([("a".to_string(), inner)].into_iter().collect())
    }

    fn get(map: Value, keys: Value) -> Value {
        let ns = namespace();
        let ns = ns.as_map().unwrap().read().clone();
        ns["get"].as_function().unwrap().call(vec![map, keys]).unwrap()
    }

    #[test]
    fn traverses_key_paths() {
        let keys = Value::from_values(vec![
            Value::String("a".into()),
            Value::String("b".into()),
        ]);
        assert_eq!(get(sample(), keys), Value::Int(7));
    }

    #[test]
    fn missing_paths_yield_null() {
        assert_eq!(get(sample(), Value::String("zzz".into())), Value::Null);
        let keys = Value::from_values(vec![
            Value::String("a".into()),
            Value::String("b".into()),
            Value::String("c".into()),
        ]);
        assert_eq!(get(sample(), keys), Value::Null);
    }

    #[test]
    fn null_map_yields_null() {
        assert_eq!(get(Value::Null, Value::String("a".into())), Value::Null);
    }
}
