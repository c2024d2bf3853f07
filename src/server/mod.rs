//! Optional HTTP façade emulating the cloud executions API.
//!
//! One listener, one thread per connection, plus a reload thread that
//! re-reads the workflow document every few seconds and swaps it in
//! atomically; executions keep the program they started with.

pub(crate) mod wire;

use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::types::Value;
use crate::workflow::WorkflowRoot;

static BASE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/v1/projects/[^/]+/locations/[^/]+/workflows/[^/]+/executions")
        .expect("base path pattern is valid")
});

/// How often the workflow document is re-read.
const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
enum ExecutionState {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

/// One execution record, serialized exactly as the API exposes it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionRecord {
    name: String,
    start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    argument: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    workflow_revision_id: String,
    call_log_level: String,
}

/// Loader callback: re-reads and recompiles the workflow document.
pub type Loader = dyn Fn() -> Result<Arc<WorkflowRoot>, String> + Send + Sync;

struct Api {
    root: RwLock<Arc<WorkflowRoot>>,
    id_base: AtomicU64,
    executions: RwLock<BTreeMap<String, Arc<RwLock<ExecutionRecord>>>>,
}

/// Serves the executions API until the process exits.
pub fn serve(listen: &str, loader: Box<Loader>) -> Result<(), String> {
    let root = loader().map_err(|e| format!("failed to load workflow: {e}"))?;
    let api = Arc::new(Api {
        root: RwLock::new(root),
        id_base: AtomicU64::new(0),
        executions: RwLock::new(BTreeMap::new()),
    });

    {
        let api = api.clone();
        thread::spawn(move || loop {
            thread::sleep(RELOAD_INTERVAL);
            match loader() {
                Ok(root) => *api.root.write() = root,
                Err(error) => tracing::warn!(%error, "failed to reload workflow"),
            }
        });
    }

    let address = listen
        .to_socket_addrs()
        .map_err(|e| format!("invalid listen address {listen:?}: {e}"))?
        .next()
        .ok_or_else(|| format!("invalid listen address {listen:?}"))?;
    let listener = TcpListener::bind(address).map_err(|e| format!("cannot listen: {e}"))?;
    tracing::info!(%address, "serving executions API");

    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let api = api.clone();
        thread::spawn(move || handle_connection(api, stream));
    }
    Ok(())
}

/// Binds the listener and serves on a background thread; returns the
/// bound address. Used by the CLI when a port-0 bind is fine and by
/// tests.
pub fn spawn(
    listen: &str,
    root: Arc<WorkflowRoot>,
) -> Result<std::net::SocketAddr, String> {
    let listener = TcpListener::bind(listen).map_err(|e| format!("cannot listen: {e}"))?;
    let address = listener.local_addr().map_err(|e| e.to_string())?;
    let api = Arc::new(Api {
        root: RwLock::new(root),
        id_base: AtomicU64::new(0),
        executions: RwLock::new(BTreeMap::new()),
    });
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let api = api.clone();
            thread::spawn(move || handle_connection(api, stream));
        }
    });
    Ok(address)
}

fn handle_connection(api: Arc<Api>, mut stream: TcpStream) {
    let request = match wire::read_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(error) => {
            tracing::debug!(%error, "failed to read request");
            return;
        }
    };

    let outcome = route(&api, &mut stream, &request);
    if let Err(error) = outcome {
        tracing::debug!(%error, "failed to write response");
    }
}

fn route(api: &Api, stream: &mut TcpStream, request: &wire::Request) -> std::io::Result<()> {
    if !BASE_PATH.is_match(&request.path) {
        return wire::write_error(stream, 404, "Not Found");
    }

    if request.path.ends_with("/executions") {
        return match request.method.as_str() {
            "GET" => list_executions(api, stream),
            "POST" => create_execution(api, stream, request),
            _ => wire::write_error(stream, 405, "Method Not Allowed"),
        };
    }

    let tail = request
        .path
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if let Some((id, custom_method)) = tail.split_once(':') {
        return match (request.method.as_str(), custom_method) {
            ("POST", "cancel") => cancel_execution(api, stream, id),
            _ => wire::write_error(stream, 405, "Method Not Allowed"),
        };
    }

    match request.method.as_str() {
        "GET" => get_execution(api, stream, &tail),
        _ => wire::write_error(stream, 405, "Method Not Allowed"),
    }
}

fn create_execution(
    api: &Api,
    stream: &mut TcpStream,
    request: &wire::Request,
) -> std::io::Result<()> {
    let body: serde_json::Value = if request.body.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!(%error, "failed to decode request body");
                return wire::write_error(stream, 400, "Bad Request");
            }
        }
    };

    let argument = body
        .get("argument")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("null")
        .to_string();
    let args_json: serde_json::Value = match serde_json::from_str(&argument) {
        Ok(args) => args,
        Err(error) => {
            tracing::debug!(%error, "failed to decode argument JSON");
            return wire::write_error(stream, 400, "Bad Request");
        }
    };

    // Monotonic textual UUID with a stable prefix.
    let id = Uuid::from_u128(api.id_base.fetch_add(1, Ordering::SeqCst) as u128 + 1).to_string();
    let record = Arc::new(RwLock::new(ExecutionRecord {
        name: format!("{}/{id}", request.path),
        start_time: Utc::now(),
        end_time: None,
        state: ExecutionState::Active,
        error: None,
        argument,
        result: None,
        workflow_revision_id: "000001-emu".to_string(),
        call_log_level: "LOG_ALL_CALLS".to_string(),
    }));
    api.executions.write().insert(id, record.clone());

    // Pin the current program: reloads must not affect this run.
    let root = api.root.read().clone();
    {
        let record = record.clone();
        thread::spawn(move || run_execution(root, record, args_json));
    }

    let rendered = serde_json::to_value(&*record.read()).unwrap_or_default();
    wire::write_json(stream, 200, "OK", &rendered)
}

fn run_execution(
    root: Arc<WorkflowRoot>,
    record: Arc<RwLock<ExecutionRecord>>,
    args: serde_json::Value,
) {
    let outcome = root.execute(Value::from_json(&args));
    let mut record = record.write();
    record.end_time = Some(Utc::now());
    match outcome {
        Ok(ret) => {
            record.state = ExecutionState::Succeeded;
            match ret.to_json() {
                Ok(json) => record.result = Some(json.to_string()),
                Err(error) => {
                    tracing::warn!(%error, "failed to encode workflow result");
                    record.result = Some("null".to_string());
                }
            }
        }
        Err(error) => {
            record.state = ExecutionState::Failed;
            record.error = Some(match error.exception() {
                Some(exception) => exception
                    .payload()
                    .to_json()
                    .map(|json| json.to_string())
                    .unwrap_or_else(|_| exception.to_string()),
                None => error.to_string(),
            });
        }
    }
}

fn list_executions(api: &Api, stream: &mut TcpStream) -> std::io::Result<()> {
    let mut records: Vec<ExecutionRecord> = api
        .executions
        .read()
        .values()
        .map(|record| record.read().clone())
        .collect();
    records.sort_by_key(|record| record.start_time);
    let rendered = serde_json::json!({ "executions": records });
    wire::write_json(stream, 200, "OK", &rendered)
}

fn get_execution(api: &Api, stream: &mut TcpStream, id: &str) -> std::io::Result<()> {
    let record = api.executions.read().get(id).cloned();
    match record {
        Some(record) => {
            let rendered = serde_json::to_value(&*record.read()).unwrap_or_default();
            wire::write_json(stream, 200, "OK", &rendered)
        }
        None => wire::write_error(stream, 404, "Not Found"),
    }
}

fn cancel_execution(_api: &Api, stream: &mut TcpStream, _id: &str) -> std::io::Result<()> {
    wire::write_error(stream, 501, "Not Implemented")
}
