//! `text.*` built-ins: charset conversion, search, regex helpers and URL
//! escaping.
//!
//! Substring search is progressive: each match resumes after the end of
//! the previous one.

use encoding_rs::Encoding;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

use crate::types::{Argument, Exception, Function, Result, Value};

use super::{namespace_of, want_bytes, want_int, want_string};

/// Everything except unreserved characters percent-encodes.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "text",
        vec![
            Function::new(
                "text.decode",
                vec![
                    Argument::required("data"),
                    Argument::with_default("charset", Value::String("UTF-8".to_string())),
                ],
                |args| {
                    let data = want_bytes(&args[0], "data")?;
                    let charset = want_string(&args[1], "charset")?;
                    let encoding = lookup_charset(&charset)?;
                    let (decoded, _, had_errors) = encoding.decode(&data);
                    if had_errors {
                        return Err(Exception::value_error(format!(
                            "data is not valid {charset}"
                        ))
                        .into());
                    }
                    Ok(Value::String(decoded.into_owned()))
                },
            ),
            Function::new(
                "text.encode",
                vec![
                    Argument::required("data"),
                    Argument::with_default("charset", Value::String("UTF-8".to_string())),
                ],
                |args| {
                    let data = want_string(&args[0], "data")?;
                    let charset = want_string(&args[1], "charset")?;
                    let encoding = lookup_charset(&charset)?;
                    let (encoded, _, had_errors) = encoding.encode(&data);
                    if had_errors {
                        return Err(Exception::value_error(format!(
                            "data cannot be represented in {charset}"
                        ))
                        .into());
                    }
                    Ok(Value::Bytes(encoded.into_owned()))
                },
            ),
            Function::new(
                "text.find_all",
                vec![Argument::required("source"), Argument::required("substr")],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let substr = want_string(&args[1], "substr")?;
                    if substr.is_empty() {
                        return Err(Exception::value_error("substr is an empty string").into());
                    }
                    let mut indexes = Vec::new();
                    let mut offset = 0;
                    while offset < source.len() {
                        let Some(found) = source[offset..].find(&substr) else {
                            break;
                        };
                        indexes.push(Value::Int((offset + found) as i64));
                        offset += found + substr.len();
                    }
                    Ok(Value::from_values(indexes))
                },
            ),
            Function::new(
                "text.find_all_regex",
                vec![Argument::required("source"), Argument::required("regexp")],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let pattern = compile_regex(&args[1])?;
                    let indexes = pattern
                        .find_iter(&source)
                        .map(|m| Value::Int(m.start() as i64))
                        .collect();
                    Ok(Value::from_values(indexes))
                },
            ),
            Function::new(
                "text.match_regex",
                vec![Argument::required("source"), Argument::required("regexp")],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let pattern = compile_regex(&args[1])?;
                    Ok(Value::Bool(pattern.is_match(&source)))
                },
            ),
            Function::new(
                "text.replace_all",
                vec![
                    Argument::required("source"),
                    Argument::required("substr"),
                    Argument::required("repl"),
                ],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let substr = want_string(&args[1], "substr")?;
                    let repl = want_string(&args[2], "repl")?;
                    Ok(Value::String(source.replace(&substr, &repl)))
                },
            ),
            Function::new(
                "text.replace_all_regex",
                vec![
                    Argument::required("source"),
                    Argument::required("substr"),
                    Argument::required("repl"),
                ],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let pattern = compile_regex(&args[1])?;
                    let repl = want_string(&args[2], "repl")?;
                    Ok(Value::String(
                        pattern.replace_all(&source, repl.as_str()).into_owned(),
                    ))
                },
            ),
            Function::new(
                "text.split",
                vec![
                    Argument::required("source"),
                    Argument::required("separator"),
                ],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let separator = want_string(&args[1], "separator")?;
                    if separator.is_empty() {
                        return Err(
                            Exception::value_error("separator is an empty string").into()
                        );
                    }
                    // A trailing separator does not produce a trailing
                    // empty piece.
                    let mut pieces = Vec::new();
                    let mut rest = source.as_str();
                    while !rest.is_empty() {
                        match rest.find(&separator) {
                            Some(i) => {
                                pieces.push(Value::String(rest[..i].to_string()));
                                rest = &rest[i + separator.len()..];
                            }
                            None => {
                                pieces.push(Value::String(rest.to_string()));
                                break;
                            }
                        }
                    }
                    Ok(Value::from_values(pieces))
                },
            ),
            Function::new(
                "text.substring",
                vec![
                    Argument::required("source"),
                    Argument::required("start"),
                    Argument::required("end"),
                ],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let start = want_int(&args[1], "start")?.max(0) as usize;
                    let end = want_int(&args[2], "end")?.max(0) as usize;
                    let chars: Vec<char> = source.chars().collect();
                    let end = end.min(chars.len());
                    let start = start.min(end);
                    Ok(Value::String(chars[start..end].iter().collect()))
                },
            ),
            Function::new("text.to_lower", vec![Argument::required("source")], |args| {
                Ok(Value::String(want_string(&args[0], "source")?.to_lowercase()))
            }),
            Function::new("text.to_upper", vec![Argument::required("source")], |args| {
                Ok(Value::String(want_string(&args[0], "source")?.to_uppercase()))
            }),
            Function::new(
                "text.url_decode",
                vec![Argument::required("source")],
                |args| {
                    let source = want_string(&args[0], "source")?.replace('+', " ");
                    let decoded = percent_decode_str(&source)
                        .decode_utf8()
                        .map_err(|e| Exception::value_error(e.to_string()))?;
                    Ok(Value::String(decoded.into_owned()))
                },
            ),
            Function::new(
                "text.url_encode",
                vec![Argument::required("source")],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    Ok(Value::String(
                        utf8_percent_encode(&source, URL_ENCODE_SET).to_string(),
                    ))
                },
            ),
            Function::new(
                "text.url_encode_plus",
                vec![Argument::required("source")],
                |args| {
                    let source = want_string(&args[0], "source")?;
                    let encoded = utf8_percent_encode(&source, URL_ENCODE_SET)
                        .to_string()
                        .replace("%20", "+");
                    Ok(Value::String(encoded))
                },
            ),
        ],
    ))
}

fn lookup_charset(charset: &str) -> Result<&'static Encoding> {
    Encoding::for_label(charset.as_bytes())
        .ok_or_else(|| Exception::value_error(format!("unknown charset: {charset}")).into())
}

fn compile_regex(value: &Value) -> Result<Regex> {
    let pattern = want_string(value, "regexp")?;
    Regex::new(&pattern).map_err(|e| Exception::value_error(e.to_string()).into())
}
