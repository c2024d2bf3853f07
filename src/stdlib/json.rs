//! `json.*` built-ins.

use serde::Serialize;

use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, want_string};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "json",
        vec![
            Function::new("json.decode", vec![Argument::required("data")], |args| {
                let data = match &args[0] {
                    Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                    Value::String(s) => s.clone(),
                    other => {
                        return Err(Exception::type_error(format!(
                            "data is not a string or bytes: got {}",
                            other.kind()
                        ))
                        .into())
                    }
                };
                let json: serde_json::Value = serde_json::from_str(&data)
                    .map_err(|e| Exception::value_error(e.to_string()))?;
                Ok(Value::from_json(&json))
            }),
            Function::new(
                "json.encode",
                vec![
                    Argument::required("data"),
                    Argument::with_default("indent", Value::Bool(false)),
                ],
                |args| encode(&args[0], &args[1]).map(Value::Bytes),
            ),
            Function::new(
                "json.encode_to_string",
                vec![
                    Argument::required("data"),
                    Argument::with_default("indent", Value::Bool(false)),
                ],
                |args| {
                    let bytes = encode(&args[0], &args[1])?;
                    Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                },
            ),
        ],
    ))
}

struct IndentConfig {
    prefix: String,
    indent: String,
}

fn encode(data: &Value, indent: &Value) -> crate::types::Result<Vec<u8>> {
    let json = data.to_json()?;

    let config = match indent {
        Value::Bool(false) => None,
        Value::Bool(true) => Some(IndentConfig {
            prefix: String::new(),
            indent: "    ".to_string(),
        }),
        Value::Map(map) => {
            let map = map.read();
            let prefix = match map.get("prefix") {
                Some(v) => want_string(v, "indent.prefix")?,
                None => String::new(),
            };
            let indent = match map.get("indent") {
                Some(v) => want_string(v, "indent.indent")?,
                None => "    ".to_string(),
            };
            Some(IndentConfig { prefix, indent })
        }
        other => {
            return Err(Exception::type_error(format!(
                "indent is not a boolean or map: got {}",
                other.kind()
            ))
            .into())
        }
    };

    let rendered = match &config {
        None => serde_json::to_vec(&json).map_err(|e| Exception::value_error(e.to_string()))?,
        Some(config) => {
            let mut out = Vec::new();
            let formatter =
                serde_json::ser::PrettyFormatter::with_indent(config.indent.as_bytes());
            let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
            json.serialize(&mut serializer)
                .map_err(|e| Exception::value_error(e.to_string()))?;
            if config.prefix.is_empty() {
                out
            } else {
                // Line prefixes apply after every newline, not the first
                // line.
                let text = String::from_utf8_lossy(&out)
                    .replace('\n', &format!("\n{}", config.prefix));
                text.into_bytes()
            }
        }
    };
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> crate::types::Result<Value> {
        let ns = namespace();
        let ns = ns.as_map().unwrap().read().clone();
        ns[name].as_function().unwrap().call(args)
    }

    #[test]
    fn decode_applies_number_policy() {
        let out = call("decode", vec![Value::String(r#"{"a": 1, "b": 1.5}"#.into())]).unwrap();
        let map = out.as_map().unwrap().read().clone();
        assert_eq!(map["a"], Value::Int(1));
        assert!(matches!(map["b"], Value::Float(f) if f == 1.5));
    }

    #[test]
    fn encode_to_string_round_trips() {
        let value = Value::from_map(
            [("k".to_string(), Value::from_values(vec![Value::Int(1)]))]
                .into_iter()
                .collect(),
        );
        let out = call("encode_to_string", vec![value]).unwrap();
        assert_eq!(out, Value::String(r#"{"k":[1]}"#.into()));
    }

    #[test]
    fn indent_true_uses_four_spaces() {
        let value = Value::from_map([("k".to_string(), Value::Int(1))].into_iter().collect());
        let out = call("encode_to_string", vec![value, Value::Bool(true)]).unwrap();
        assert_eq!(out.as_str().unwrap(), "{\n    \"k\": 1\n}");
    }

    #[test]
    fn indent_config_applies_prefix() {
        let value = Value::from_map([("k".to_string(), Value::Int(1))].into_iter().collect());
        let config = Value::from_map(
            [
                ("prefix".to_string(), Value::String("> ".into())),
                ("indent".to_string(), Value::String("  ".into())),
            ]
            .into_iter()
            .collect(),
        );
        let out = call("encode_to_string", vec![value, config]).unwrap();
        assert_eq!(out.as_str().unwrap(), "{\n>   \"k\": 1\n> }");
    }

    #[test]
    fn invalid_json_is_a_value_error() {
        let err = call("decode", vec![Value::String("{oops".into())]).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::ValueError)
        );
    }
}
