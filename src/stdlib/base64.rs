//! `base64.*` built-ins.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;

use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, want_bool, want_bytes, want_string};

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "base64",
        vec![
            Function::new(
                "base64.encode",
                vec![
                    Argument::required("data"),
                    Argument::with_default("padding", Value::Bool(true)),
                ],
                |args| {
                    let data = want_bytes(&args[0], "data")?;
                    let padding = want_bool(&args[1], "padding")?;
                    let encoded = if padding {
                        STANDARD.encode(data)
                    } else {
                        STANDARD_NO_PAD.encode(data)
                    };
                    Ok(Value::String(encoded))
                },
            ),
            Function::new(
                "base64.decode",
                vec![
                    Argument::required("data"),
                    Argument::with_default("padding", Value::Bool(true)),
                ],
                |args| {
                    let data = want_string(&args[0], "data")?;
                    let padding = want_bool(&args[1], "padding")?;
                    let decoded = if padding {
                        STANDARD.decode(data.as_bytes())
                    } else {
                        STANDARD_NO_PAD.decode(data.as_bytes())
                    };
                    decoded
                        .map(Value::Bytes)
                        .map_err(|e| Exception::value_error(e.to_string()).into())
                },
            ),
        ],
    ))
}
