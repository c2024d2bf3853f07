//! Executions-API façade round trip over a real socket.

use std::time::{Duration, Instant};

use cadenza::WorkflowRoot;

const BASE: &str = "/v1/projects/demo/locations/local/workflows/wf/executions";

fn serve(yaml: &str) -> String {
    let root = WorkflowRoot::parse_yaml(yaml.as_bytes()).expect("compile");
    let address = cadenza::server::spawn("127.0.0.1:0", root).expect("spawn");
    format!("http://{address}")
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("client")
}

#[test]
fn create_then_fetch_a_succeeding_execution() {
    let base = serve(
        r#"
main:
  params: [x]
  steps:
    - s:
        return: "${x * 2}"
"#,
    );
    let client = client();

    let created: serde_json::Value = client
        .post(format!("{base}{BASE}"))
        .json(&serde_json::json!({"argument": "21"}))
        .send()
        .expect("create")
        .json()
        .expect("create body");
    assert_eq!(created["state"], "ACTIVE");
    assert_eq!(created["argument"], "21");
    let name = created["name"].as_str().expect("name");
    let id = name.rsplit('/').next().expect("id");
    assert_eq!(id.len(), 36, "textual UUID: {id}");

    let record = wait_for_completion(&client, &format!("{base}{BASE}/{id}"));
    assert_eq!(record["state"], "SUCCEEDED");
    assert_eq!(record["result"], "42");
    assert!(record.get("endTime").is_some());
}

#[test]
fn failures_carry_the_exception_payload() {
    let base = serve(
        r#"
main:
  steps:
    - boom:
        raise:
          tags: ["Kaboom"]
"#,
    );
    let client = client();

    let created: serde_json::Value = client
        .post(format!("{base}{BASE}"))
        .json(&serde_json::json!({"argument": "null"}))
        .send()
        .expect("create")
        .json()
        .expect("create body");
    let id = created["name"]
        .as_str()
        .and_then(|name| name.rsplit('/').next())
        .expect("id")
        .to_string();

    let record = wait_for_completion(&client, &format!("{base}{BASE}/{id}"));
    assert_eq!(record["state"], "FAILED");
    let error = record["error"].as_str().expect("error payload");
    assert!(error.contains("Kaboom"), "error: {error}");
}

#[test]
fn listing_returns_executions_sorted_by_start_time() {
    let base = serve(
        r#"
main:
  steps:
    - s:
        return: 1
"#,
    );
    let client = client();

    for _ in 0..3 {
        client
            .post(format!("{base}{BASE}"))
            .json(&serde_json::json!({"argument": "null"}))
            .send()
            .expect("create");
    }

    let listing: serde_json::Value = client
        .get(format!("{base}{BASE}"))
        .send()
        .expect("list")
        .json()
        .expect("list body");
    let executions = listing["executions"].as_array().expect("executions");
    assert_eq!(executions.len(), 3);
    let starts: Vec<&str> = executions
        .iter()
        .map(|e| e["startTime"].as_str().expect("startTime"))
        .collect();
    let mut sorted = starts.clone();
    sorted.sort();
    assert_eq!(starts, sorted);
}

#[test]
fn unknown_executions_are_404() {
    let base = serve("main: {steps: [{s: {return: 1}}]}");
    let response = client()
        .get(format!("{base}{BASE}/00000000-0000-0000-0000-00000000abcd"))
        .send()
        .expect("get");
    assert_eq!(response.status().as_u16(), 404);
}

#[test]
fn cancel_is_unimplemented() {
    let base = serve("main: {steps: [{s: {return: 1}}]}");
    let client = client();
    let created: serde_json::Value = client
        .post(format!("{base}{BASE}"))
        .json(&serde_json::json!({"argument": "null"}))
        .send()
        .expect("create")
        .json()
        .expect("create body");
    let id = created["name"]
        .as_str()
        .and_then(|name| name.rsplit('/').next())
        .expect("id")
        .to_string();

    let response = client
        .post(format!("{base}{BASE}/{id}:cancel"))
        .send()
        .expect("cancel");
    assert_eq!(response.status().as_u16(), 501);
}

#[test]
fn paths_outside_the_base_are_404() {
    let base = serve("main: {steps: [{s: {return: 1}}]}");
    let response = client()
        .get(format!("{base}/healthz"))
        .send()
        .expect("get");
    assert_eq!(response.status().as_u16(), 404);
}

fn wait_for_completion(client: &reqwest::blocking::Client, url: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let record: serde_json::Value = client
            .get(url)
            .send()
            .expect("get")
            .json()
            .expect("record body");
        if record["state"] != "ACTIVE" {
            return record;
        }
        assert!(Instant::now() < deadline, "execution did not finish");
        std::thread::sleep(Duration::from_millis(20));
    }
}
