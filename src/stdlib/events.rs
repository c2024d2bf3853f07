//! `events.*` built-ins: one-shot HTTP callback endpoints.
//!
//! `create_callback_endpoint` binds an ephemeral port and serves it on a
//! background thread; `await_callback` blocks until exactly one matching
//! request has been consumed (or the timeout expires) and shuts the
//! endpoint down. Only the first matching delivery succeeds; later ones
//! get a 400.

use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;

use crate::server::wire;
use crate::types::{Argument, Exception, Function, Value};

use super::{namespace_of, want_map, want_number, want_string};

/// Map key under which the endpoint handle travels inside the value
/// returned to the workflow.
const CALLBACK_HANDLE_KEY: &str = "__internal_event_callback";

/// State shared between the serving thread and `await_callback`.
struct CallbackEndpoint {
    address: std::net::SocketAddr,
    receiver: Mutex<Receiver<Value>>,
    consumed: AtomicBool,
    shutdown: AtomicBool,
}

pub(crate) fn namespace() -> Value {
    Value::from_map(namespace_of(
        "events",
        vec![
            Function::new(
                "events.create_callback_endpoint",
                vec![Argument::with_default(
                    "http_callback_method",
                    Value::String("POST".to_string()),
                )],
                |args| {
                    let method = want_string(&args[0], "http_callback_method")?;
                    create_endpoint(method)
                },
            ),
            Function::new(
                "events.await_callback",
                vec![
                    Argument::required("callback"),
                    Argument::with_default("timeout", Value::Float(43200.0)),
                ],
                |args| {
                    let callback = want_map(&args[0], "callback")?;
                    let timeout = want_number(&args[1], "timeout")?;
                    await_callback(&callback, timeout)
                },
            ),
        ],
    ))
}

fn create_endpoint(method: String) -> crate::types::Result<Value> {
    let listener = TcpListener::bind("0.0.0.0:0")
        .map_err(|e| crate::types::RuntimeError::host(format!("cannot bind callback endpoint: {e}")))?;
    let address = listener
        .local_addr()
        .map_err(|e| crate::types::RuntimeError::host(e.to_string()))?;

    let (sender, receiver) = mpsc::sync_channel(1);
    let endpoint = Arc::new(CallbackEndpoint {
        address,
        receiver: Mutex::new(receiver),
        consumed: AtomicBool::new(false),
        shutdown: AtomicBool::new(false),
    });

    {
        let endpoint = endpoint.clone();
        thread::spawn(move || serve(listener, endpoint, method, sender));
    }

    let url = format!("http://127.0.0.1:{}/", address.port());
    tracing::debug!(%url, "created HTTP callback endpoint");

    let mut out = BTreeMap::new();
    out.insert("url".to_string(), Value::String(url));
    out.insert(
        CALLBACK_HANDLE_KEY.to_string(),
        Value::Opaque(endpoint),
    );
    Ok(Value::from_map(out))
}

fn serve(
    listener: TcpListener,
    endpoint: Arc<CallbackEndpoint>,
    method: String,
    sender: SyncSender<Value>,
) {
    for stream in listener.incoming() {
        if endpoint.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut stream) = stream else { continue };
        if let Err(error) = handle_delivery(&mut stream, &endpoint, &method, &sender) {
            tracing::debug!(%error, "callback delivery failed");
        }
    }
}

fn handle_delivery(
    stream: &mut TcpStream,
    endpoint: &CallbackEndpoint,
    method: &str,
    sender: &SyncSender<Value>,
) -> std::io::Result<()> {
    let Some(request) = wire::read_request(stream)? else {
        return Ok(());
    };
    if request.method != method {
        return wire::write_error(stream, 405, "Method Not Allowed");
    }
    if endpoint.consumed.swap(true, Ordering::SeqCst) {
        return wire::write_error(stream, 400, "Callback request is already consumed");
    }

    let mut headers = BTreeMap::new();
    for (name, value) in &request.headers {
        headers.insert(name.clone(), Value::String(value.clone()));
    }
    let mut query = BTreeMap::new();
    for (name, value) in &request.query {
        query.insert(name.clone(), Value::String(value.clone()));
    }

    let body = if request.body.is_empty() {
        Value::Null
    } else if request
        .header("content-type")
        .map(is_json_media_type)
        .unwrap_or(false)
    {
        match serde_json::from_slice::<serde_json::Value>(&request.body) {
            Ok(json) => Value::from_json(&json),
            Err(_) => {
                endpoint.consumed.store(false, Ordering::SeqCst);
                return wire::write_error(stream, 400, "Invalid JSON format");
            }
        }
    } else {
        Value::String(String::from_utf8_lossy(&request.body).into_owned())
    };

    let mut http_request = BTreeMap::new();
    http_request.insert("method".to_string(), Value::String(request.method));
    http_request.insert("headers".to_string(), Value::from_map(headers));
    http_request.insert("url".to_string(), Value::String(request.path));
    http_request.insert("query".to_string(), Value::from_map(query));
    http_request.insert("body".to_string(), body);

    let mut payload = BTreeMap::new();
    payload.insert("type".to_string(), Value::String("HTTP".to_string()));
    payload.insert("http_request".to_string(), Value::from_map(http_request));
    payload.insert(
        "received_time".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );

    wire::write_response(stream, 204, "No Content", None, b"")?;
    let _ = sender.try_send(Value::from_map(payload));
    Ok(())
}

fn is_json_media_type(content_type: &str) -> bool {
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media == "application/json"
        || media.starts_with("application/json+")
        || media.ends_with("+json")
}

fn await_callback(
    callback: &crate::types::ValueMap,
    timeout_seconds: f64,
) -> crate::types::Result<Value> {
    let handle = callback.read().get(CALLBACK_HANDLE_KEY).cloned();
    let Some(Value::Opaque(handle)) = handle else {
        return Err(Exception::type_error("callback is not a callback object").into());
    };
    let Ok(endpoint) = handle.downcast::<CallbackEndpoint>() else {
        return Err(Exception::type_error("callback is not a callback object").into());
    };

    let receiver = endpoint.receiver.lock();
    let result = receiver.recv_timeout(Duration::from_secs_f64(timeout_seconds.max(0.0)));
    drop(receiver);
    shutdown(&endpoint);

    match result {
        Ok(payload) => Ok(payload),
        Err(RecvTimeoutError::Timeout) => {
            Err(Exception::timeout("no callback request arrived in time").into())
        }
        Err(RecvTimeoutError::Disconnected) => Err(crate::types::RuntimeError::host(
            "callback endpoint stopped unexpectedly",
        )),
    }
}

/// Stops the serving thread: set the flag, then poke the listener so the
/// blocking accept wakes up.
fn shutdown(endpoint: &CallbackEndpoint) {
    endpoint.shutdown.store(true, Ordering::SeqCst);
    let _ = TcpStream::connect(("127.0.0.1", endpoint.address.port()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn call(name: &str, args: Vec<Value>) -> crate::types::Result<Value> {
        let ns = namespace();
        let ns = ns.as_map().unwrap().read().clone();
        ns[name].as_function().unwrap().call(args)
    }

    fn post(url: &str, body: &str) -> String {
        let address = url
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let mut stream = TcpStream::connect(address).expect("connect");
        stream
            .write_all(
                format!(
                    "POST /cb?x=1 HTTP/1.1\r\nHost: t\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )
                .as_bytes(),
            )
            .expect("send");
        let mut out = String::new();
        use std::io::Read;
        let _ = stream.read_to_string(&mut out);
        out
    }

    #[test]
    fn delivers_exactly_one_callback() {
        let endpoint = call("create_callback_endpoint", vec![]).expect("create");
        let url = endpoint
            .as_map()
            .unwrap()
            .read()
            .get("url")
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();

        let poster = thread::spawn(move || {
            // Give the awaiting side a moment to block first.
            thread::sleep(Duration::from_millis(50));
            post(&url, r#"{"k": 7}"#)
        });

        let payload = call("await_callback", vec![endpoint, Value::Float(5.0)]).expect("await");
        let response = poster.join().expect("poster");
        assert!(response.starts_with("HTTP/1.1 204"));

        let payload = payload.as_map().unwrap().read().clone();
        assert_eq!(payload["type"], Value::String("HTTP".into()));
        let request = payload["http_request"].as_map().unwrap().read().clone();
        assert_eq!(request["method"], Value::String("POST".into()));
        assert_eq!(request["url"], Value::String("/cb".into()));
        let body = request["body"].as_map().unwrap().read().clone();
        assert_eq!(body["k"], Value::Int(7));
    }

    #[test]
    fn await_times_out_with_a_timeout_error() {
        let endpoint = call("create_callback_endpoint", vec![]).expect("create");
        let err = call("await_callback", vec![endpoint, Value::Float(0.05)]).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::TimeoutError)
        );
    }

    #[test]
    fn non_callback_maps_are_rejected() {
        let err = call("await_callback", vec![Value::empty_map()]).unwrap_err();
        assert_eq!(
            err.exception().and_then(Exception::tag),
            Some(crate::types::ErrorTag::TypeError)
        );
    }
}
