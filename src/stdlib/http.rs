//! `http.*` built-ins: the outbound request family, retry predicates and
//! the bundled default retry policies.
//!
//! Responses surface as `{code, headers, body}` with JSON bodies decoded
//! automatically. Error statuses (≥ 400) raise a tagged HTTP error whose
//! extra fields are that same map, which is exactly what the default
//! retry predicates inspect. Transport failures classify as connection
//! or timeout errors.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};

use crate::types::{
    Argument, ErrorTag, Exception, Function, Result, TaggedError, Value,
};

use super::{namespace_of, opt, retry, want_map, want_number, want_string};

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .build()
        .expect("HTTP client construction cannot fail with default TLS")
});

#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyKind {
    Json,
    Text,
    Form,
}

pub(crate) fn namespace() -> Value {
    let mut entries = namespace_of(
        "http",
        vec![
            Function::new(
                "http.request",
                vec![
                    Argument::required("method"),
                    Argument::required("url"),
                    Argument::with_default("timeout", Value::Float(300.0)),
                    Argument::optional("body"),
                    Argument::optional("headers"),
                    Argument::optional("query"),
                    Argument::optional("auth"),
                ],
                |args| {
                    let method = want_string(&args[0], "method")?;
                    request(&method, &args[1], &args[2], &args[3], &args[4], &args[5], &args[6])
                },
            ),
            method_function("http.get", Method::GET, false),
            method_function("http.post", Method::POST, true),
            method_function("http.put", Method::PUT, true),
            method_function("http.patch", Method::PATCH, true),
            method_function("http.delete", Method::DELETE, true),
            Function::new(
                "http.default_retry_predicate",
                vec![Argument::required("exception")],
                |args| Ok(Value::Bool(retryable_code(&args[0], &[429, 502, 503, 504]))),
            ),
            Function::new(
                "http.default_retry_predicate_non_idempotent",
                vec![Argument::required("exception")],
                |args| Ok(Value::Bool(retryable_code(&args[0], &[429, 503]))),
            ),
        ],
    );

    entries.insert(
        "default_retry".to_string(),
        retry_bundle("${http.default_retry_predicate}"),
    );
    entries.insert(
        "default_retry_non_idempotent".to_string(),
        retry_bundle("${http.default_retry_predicate_non_idempotent}"),
    );
    Value::from_map(entries)
}

fn retry_bundle(predicate: &str) -> Value {
    let mut bundle = BTreeMap::new();
    bundle.insert("predicate".to_string(), Value::String(predicate.to_string()));
    bundle.insert("max_retries".to_string(), Value::Int(5));
    bundle.insert("backoff".to_string(), retry::default_backoff());
    Value::from_map(bundle)
}

fn method_function(name: &'static str, method: Method, has_body: bool) -> Function {
    let mut args = vec![
        Argument::required("url"),
        Argument::with_default("timeout", Value::Float(300.0)),
    ];
    if has_body {
        args.push(Argument::optional("body"));
    }
    args.extend([
        Argument::optional("headers"),
        Argument::optional("query"),
        Argument::optional("auth"),
    ]);
    Function::new(name, args, move |args| {
        let (body, rest) = if has_body {
            (args[2].clone(), &args[3..])
        } else {
            (Value::Null, &args[2..])
        };
        request(
            method.as_str(),
            &args[0],
            &args[1],
            &body,
            &rest[0],
            &rest[1],
            &rest[2],
        )
    })
}

/// The code an exception carries, normalized to a plain integer.
fn retryable_code(exception: &Value, retryable: &[i64]) -> bool {
    let Some(map) = exception.as_map() else {
        return false;
    };
    let code = map.read().get("code").and_then(|code| match code {
        Value::Int(n) => Some(*n),
        Value::Float(n) => Some(*n as i64),
        _ => None,
    });
    matches!(code, Some(code) if retryable.contains(&code))
}

fn request(
    method: &str,
    url: &Value,
    timeout: &Value,
    body: &Value,
    headers: &Value,
    query: &Value,
    auth: &Value,
) -> Result<Value> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| Exception::value_error(format!("invalid HTTP method: {method}")))?;
    let url = want_string(url, "url")?;
    let timeout = want_number(timeout, "timeout")?;

    let mut url = Url::parse(&url).map_err(|e| Exception::value_error(e.to_string()))?;
    merge_query(&mut url, query)?;

    let body_kind = detect_body_kind(headers)?;
    let wants_body = !body.is_nil()
        && [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(&method);

    let mut header_map = build_headers(headers)?;
    if wants_body && !header_map.contains_key(CONTENT_TYPE) {
        let content_type = match body_kind {
            BodyKind::Json => "application/json",
            BodyKind::Text => "text/plain",
            BodyKind::Form => "application/x-www-form-urlencoded",
        };
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    apply_auth(&mut header_map, auth)?;

    tracing::debug!(%method, %url, "outbound HTTP request");
    let mut builder: RequestBuilder = CLIENT.request(method, url).headers(header_map);
    if timeout > 0.0 {
        builder = builder.timeout(Duration::from_secs_f64(timeout));
    }
    if wants_body {
        builder = builder.body(encode_body(body, body_kind)?);
    }

    let response = builder.send().map_err(classify_transport_error)?;
    let code = response.status().as_u16() as i64;

    let mut response_headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            response_headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| media_type(v) == "application/json")
        .unwrap_or(false);
    let raw = response
        .bytes()
        .map_err(classify_transport_error)?
        .to_vec();
    let response_body = if is_json {
        let json: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| Exception::value_error(format!("invalid JSON response: {e}")))?;
        Value::from_json(&json)
    } else {
        Value::Bytes(raw)
    };

    let mut result = BTreeMap::new();
    result.insert("code".to_string(), Value::Int(code));
    result.insert(
        "headers".to_string(),
        Value::from_map(response_headers),
    );
    result.insert("body".to_string(), response_body);
    let result = Value::from_map(result);

    if code >= 400 {
        let extra = result.as_map().unwrap().clone();
        return Err(Exception::Tagged(
            TaggedError::new(
                ErrorTag::HttpError,
                format!("HTTP server responded with error code {code}"),
            )
            .with_extra(extra),
        )
        .into());
    }
    Ok(result)
}

fn classify_transport_error(error: reqwest::Error) -> crate::types::RuntimeError {
    if error.is_timeout() {
        Exception::timeout(error.to_string()).into()
    } else {
        Exception::tagged(ErrorTag::ConnectionError, error.to_string()).into()
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn detect_body_kind(headers: &Value) -> Result<BodyKind> {
    let Some(headers) = opt(headers) else {
        return Ok(BodyKind::Json);
    };
    let headers = want_map(headers, "headers")?;
    for (name, value) in headers.read().iter() {
        if !name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        let value = want_string(value, "headers.Content-Type")?;
        let media = media_type(&value);
        return if media.starts_with("text/") {
            Ok(BodyKind::Text)
        } else if media == "application/x-www-form-urlencoded" {
            Ok(BodyKind::Form)
        } else if media == "application/json"
            || (media.starts_with("application/") && media.ends_with("+json"))
        {
            Ok(BodyKind::Json)
        } else {
            Err(Exception::value_error(format!("unsupported Content-Type: {value}")).into())
        };
    }
    Ok(BodyKind::Json)
}

fn encode_body(body: &Value, kind: BodyKind) -> Result<Vec<u8>> {
    match (body, kind) {
        (Value::String(s), BodyKind::Text | BodyKind::Form) => Ok(s.clone().into_bytes()),
        (Value::Map(_), BodyKind::Json) => {
            let json = body.to_json()?;
            serde_json::to_vec(&json).map_err(|e| Exception::value_error(e.to_string()).into())
        }
        (Value::List(_), BodyKind::Json) => {
            let json = body.to_json()?;
            serde_json::to_vec(&json).map_err(|e| Exception::value_error(e.to_string()).into())
        }
        (other, _) => Err(Exception::value_error(format!(
            "invalid body type for the request Content-Type: {}",
            other.kind()
        ))
        .into()),
    }
}

/// Later values override existing parameters of the same name.
fn merge_query(url: &mut Url, query: &Value) -> Result<()> {
    let Some(query) = opt(query) else {
        return Ok(());
    };
    let query = want_map(query, "query")?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    for (name, value) in query.read().iter() {
        let rendered = render_scalar(value)
            .ok_or_else(|| Exception::value_error(format!("unsupported query value: {name}")))?;
        match pairs.iter_mut().find(|(k, _)| k == name) {
            Some(pair) => pair.1 = rendered,
            None => pairs.push((name.clone(), rendered)),
        }
    }
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(())
}

fn build_headers(headers: &Value) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    let Some(headers) = opt(headers) else {
        return Ok(map);
    };
    let headers = want_map(headers, "headers")?;
    for (name, value) in headers.read().iter() {
        let rendered = render_scalar(value).ok_or_else(|| {
            Exception::value_error(format!("unsupported header value for field {name}"))
        })?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Exception::value_error(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(&rendered)
            .map_err(|e| Exception::value_error(format!("invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Float(n) => Some(super::helpers::format_float(*n)),
        _ => None,
    }
}

/// Resolves an `auth` block to a bearer token. Tokens come from the
/// environment or, failing that, the `gcloud` CLI.
fn apply_auth(headers: &mut HeaderMap, auth: &Value) -> Result<()> {
    let Some(auth) = opt(auth) else {
        return Ok(());
    };
    let auth = want_map(auth, "auth")?;
    let auth_type = auth
        .read()
        .get("type")
        .cloned()
        .ok_or_else(|| Exception::value_error("auth.type is required"))?;
    let auth_type = want_string(&auth_type, "auth.type")?;

    let token = match auth_type.as_str() {
        "OIDC" => resolve_token("CADENZA_OIDC_TOKEN", "print-identity-token")?,
        "OAuth2" => resolve_token("CADENZA_OAUTH2_TOKEN", "print-access-token")?,
        other => {
            return Err(Exception::value_error(format!("unknown auth.type: {other}")).into())
        }
    };

    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| Exception::tagged(ErrorTag::AuthError, e.to_string()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(())
}

fn resolve_token(env_var: &str, gcloud_subcommand: &str) -> Result<String> {
    if let Ok(token) = std::env::var(env_var) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    let output = Command::new("gcloud")
        .args(["auth", gcloud_subcommand])
        .output()
        .map_err(|e| {
            Exception::tagged(
                ErrorTag::AuthError,
                format!("no {env_var} set and gcloud is unavailable: {e}"),
            )
        })?;
    if !output.status.success() {
        return Err(Exception::tagged(
            ErrorTag::AuthError,
            format!("gcloud auth {gcloud_subcommand} failed"),
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
