//! `time.*` built-ins: Unix-seconds to RFC 3339 and back.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, want_string};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "time",
        vec![
            Function::new(
                "time.format",
                vec![
                    Argument::required("seconds"),
                    Argument::optional("timezone"),
                ],
                |args| {
                    let timestamp = match &args[0] {
                        Value::Int(n) => Utc.timestamp_opt(*n, 0).single(),
                        Value::Float(n) => {
                            let micros = (n * 1_000_000.0).floor() as i64;
                            let seconds = micros.div_euclid(1_000_000);
                            let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
                            Utc.timestamp_opt(seconds, nanos).single()
                        }
                        other => {
                            return Err(Exception::type_error(format!(
                                "seconds is not a number: got {}",
                                other.kind()
                            ))
                            .into())
                        }
                    };
                    let Some(timestamp) = timestamp else {
                        return Err(
                            Exception::value_error("seconds is out of range").into()
                        );
                    };
                    Ok(Value::String(
                        timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    ))
                },
            ),
            Function::new("time.parse", vec![Argument::required("value")], |args| {
                let value = want_string(&args[0], "value")?;
                let parsed = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| Exception::value_error(e.to_string()))?;
                Ok(Value::Int(parsed.timestamp()))
            }),
        ],
    ))
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
    fn format_and_parse_round_trip() {
        let formatted = call("format", vec![Value::Int(1_700_000_000)]).unwrap();
        assert_eq!(formatted.as_str().unwrap(), "2023-11-14T22:13:20Z");
        let parsed = call("parse", vec![formatted]).unwrap();
        assert_eq!(parsed, Value::Int(1_700_000_000));
    }

    #[test]
    fn fractional_seconds_survive_formatting() {
        let formatted = call("format", vec![Value::Float(1.5)]).unwrap();
        assert!(formatted.as_str().unwrap().starts_with("1970-01-01T00:00:01.5"));
    }

    #[test]
    fn parse_accepts_nanosecond_precision() {
        let parsed = call(
            "parse",
            vec![Value::String("2023-11-14T22:13:20.123456789Z".into())],
        )
        .unwrap();
        assert_eq!(parsed, Value::Int(1_700_000_000));
    }

    #[test]
    fn parse_rejects_other_formats() {
        let err = call("parse", vec![Value::String("14/11/2023".into())]).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::ValueError)
        );
    }
}
