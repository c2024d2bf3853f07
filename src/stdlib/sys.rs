//! `sys.*` built-ins: clock access, sleeping, environment lookup and the
//! structured log sink.
//!
//! `sys.log` emits exactly one JSON line on stderr; the line itself is
//! the contract, so it bypasses the tracing pipeline.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, want_string};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "sys",
        vec![
            Function::raw("sys.now", vec![], |_| Ok(Value::Int(Utc::now().timestamp()))),
            Function::new("sys.sleep", vec![Argument::required("seconds")], |args| {
                let seconds = match &args[0] {
                    Value::Int(n) => *n as f64,
                    Value::Float(n) => *n,
                    other => {
                        return Err(Exception::type_error(format!(
                            "seconds is not a number: got {}",
                            other.kind()
                        ))
                        .into())
                    }
                };
                if seconds > 0.0 {
                    thread::sleep(Duration::from_secs_f64(seconds));
                }
                Ok(Value::Null)
            }),
            Function::new(
                "sys.sleep_until",
                vec![Argument::required("time")],
                |args| {
                    let time = want_string(&args[0], "time")?;
                    let target = DateTime::parse_from_rfc3339(&time)
                        .map_err(|e| Exception::value_error(e.to_string()))?;
                    let remaining = target.with_timezone(&Utc) - Utc::now();
                    if let Ok(remaining) = remaining.to_std() {
                        thread::sleep(remaining);
                    }
                    Ok(Value::Null)
                },
            ),
            Function::new(
                "sys.get_env",
                vec![Argument::required("name"), Argument::required("default")],
                |args| {
                    let name = want_string(&args[0], "name")?;
                    let default = want_string(&args[1], "default")?;
                    Ok(Value::String(std::env::var(name).unwrap_or(default)))
                },
            ),
            Function::new(
                "sys.log",
                vec![
                    Argument::with_default("data", Value::Omitted),
                    Argument::with_default("severity", Value::String("DEFAULT".to_string())),
                    Argument::optional("text"),
                    Argument::optional("json"),
                ],
                |args| {
                    let data = &args[0];
                    let severity = want_string(&args[1], "severity")?;
                    let text = &args[2];
                    let json = &args[3];

                    let provided = [
                        !matches!(data, Value::Omitted),
                        !text.is_nil(),
                        !json.is_nil(),
                    ]
                    .iter()
                    .filter(|p| **p)
                    .count();
                    if provided > 1 {
                        return Err(Exception::type_error(
                            "one of data or text or json is needed, cannot specify multiple",
                        )
                        .into());
                    }
                    if provided == 0 {
                        return Err(Exception::type_error(
                            "one of data or text or json is required",
                        )
                        .into());
                    }

                    let (key, payload) = if !matches!(data, Value::Omitted) {
                        match data {
                            Value::Map(_) => ("jsonPayload", data.clone()),
                            other => ("textPayload", other.clone()),
                        }
                    } else if !text.is_nil() {
                        ("textPayload", text.clone())
                    } else {
                        ("jsonPayload", json.clone())
                    };

                    let mut line = serde_json::Map::new();
                    line.insert(
                        "severity".to_string(),
                        serde_json::Value::String(severity),
                    );
                    line.insert(key.to_string(), payload.to_json()?);
                    eprintln!("{}", serde_json::Value::Object(line));
                    Ok(Value::Null)
                },
            ),
        ],
    ))
}
