//! HTTP end-to-end tests: a real podgate server on a random port, backed by
//! the mock engine, exercised with a real HTTP client.

use podgate_core::{Config, Dispatcher};
use podgate_engine::MockEngine;
use podgate_server::{HttpService, TestServer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Client {
    agent: ureq::Agent,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(15)))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            base: base.to_owned(),
        }
    }

    fn finish(resp: Result<ureq::http::Response<ureq::Body>, ureq::Error>) -> (u16, Value) {
        let mut resp = resp.unwrap();
        let status = resp.status().as_u16();
        let text = resp.body_mut().read_to_string().unwrap();
        (status, serde_json::from_str(&text).unwrap())
    }

    fn get(&self, path: &str) -> (u16, Value) {
        Self::finish(self.agent.get(&format!("{}{path}", self.base)).call())
    }

    fn delete(&self, path: &str) -> (u16, Value) {
        Self::finish(self.agent.delete(&format!("{}{path}", self.base)).call())
    }

    fn post_raw(&self, path: &str, body: &str) -> (u16, Value) {
        Self::finish(
            self.agent
                .post(&format!("{}{path}", self.base))
                .header("Content-Type", "application/json")
                .send(body.as_bytes()),
        )
    }

    fn post(&self, path: &str, body: &Value) -> (u16, Value) {
        self.post_raw(path, &body.to_string())
    }
}

fn start() -> (TestServer, Client) {
    let server = TestServer::start().unwrap();
    let client = Client::new(&server.url);
    (server, client)
}

fn create(client: &Client, name: &str) -> Value {
    let (status, body) = client.post(
        "/containers",
        &json!({"image": "alpine:latest", "name": name, "command": "sleep 300"}),
    );
    assert_eq!(status, 200, "{body}");
    body
}

fn assert_error(status: u16, body: &Value, code: u16, kind: &str) {
    assert_eq!(status, code, "{body}");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], code);
    assert_eq!(body["error"]["type"], kind);
    assert!(body["error"]["message"].is_string());
    assert!(body["timestamp"].is_string());
}

#[test]
fn missing_name_is_400_without_engine_call() {
    let (server, client) = start();
    let (status, body) = client.post("/containers", &json!({"image": "alpine:latest"}));
    assert_error(status, &body, 400, "Validation");
    assert!(body["error"]["message"].as_str().unwrap().contains("name"));
    assert_eq!(server.engine.calls(), 0);
}

#[test]
fn create_alpine_returns_running_container() {
    let (_server, client) = start();
    let body = create(&client, "demo");
    assert_eq!(body["success"], true);
    assert_eq!(body["container"]["name"], "demo");
    assert_eq!(body["container"]["status"], "running");
    assert_eq!(body["container"]["image"], "alpine:latest");
    assert_eq!(body["container"]["id"].as_str().unwrap().len(), 12);
    assert!(body["timestamp"].is_string());
}

#[test]
fn exec_on_unknown_container_is_404() {
    let (_server, client) = start();
    let (status, body) = client.post("/containers/ghost/exec", &json!({"command": "ls"}));
    assert_error(status, &body, 404, "NotFound");
}

#[test]
fn slow_exec_is_408_promptly() {
    let engine = Arc::new(MockEngine::new().with_exec_delay(Duration::from_secs(3)));
    let server = TestServer::start_with(engine, Some(Duration::from_millis(300))).unwrap();
    let client = Client::new(&server.url);
    create(&client, "demo");

    let started = Instant::now();
    let (status, body) = client.post("/containers/demo/exec", &json!({"command": "sleep 60"}));
    let elapsed = started.elapsed();

    assert_error(status, &body, 408, "Timeout");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[test]
fn engine_down_health_is_503() {
    let (server, client) = start();
    let (status, body) = client.get("/health");
    assert_eq!(status, 200);
    assert_eq!(body["health"]["status"], "healthy");
    assert_eq!(body["health"]["backend"], "mock");

    server.engine.set_available(false);
    let (status, body) = client.get("/health");
    assert_error(status, &body, 503, "EngineUnavailable");
}

#[test]
fn add_file_then_cat_returns_exact_content() {
    let (_server, client) = start();
    create(&client, "demo");

    let content = "first line\n  indented \"quoted\" line\nünïcödé\n";
    let (status, body) = client.post(
        "/containers/demo/files",
        &json!({"dest_path": "/tmp/hello.txt", "content": content}),
    );
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["file"]["dest_path"], "/tmp/hello.txt");
    assert_eq!(body["file"]["size"], content.len());

    let (status, body) = client.post(
        "/containers/demo/exec",
        &json!({"command": "cat /tmp/hello.txt"}),
    );
    assert_eq!(status, 200);
    assert_eq!(body["execution"]["exit_code"], 0);
    assert_eq!(body["execution"]["success"], true);
    assert_eq!(body["execution"]["output"], content);
}

#[test]
fn lifecycle_over_http() {
    let (_server, client) = start();
    create(&client, "web");

    let (status, body) = client.post("/containers/web/stop", &json!({}));
    assert_eq!(status, 200);
    assert_eq!(body["container"]["status"], "stopped");

    // stopping again still succeeds
    let (status, _) = client.post("/containers/web/stop", &json!({}));
    assert_eq!(status, 200);

    let (status, body) = client.post("/containers/web/start", &json!({}));
    assert_eq!(status, 200);
    assert_eq!(body["container"]["status"], "started");

    let (status, body) = client.delete("/containers/web?force=true");
    assert_eq!(status, 200);
    assert_eq!(body["container"]["removed"], true);

    let (status, body) = client.delete("/containers/web");
    assert_error(status, &body, 404, "NotFound");
}

#[test]
fn list_and_logs() {
    let (_server, client) = start();
    create(&client, "a");
    create(&client, "b");

    let (status, body) = client.get("/containers");
    assert_eq!(status, 200);
    let names: Vec<&str> = body["containers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let (status, body) = client.get("/containers/a/logs?tail=1");
    assert_eq!(status, 200);
    assert_eq!(body["container"]["name"], "a");
    assert!(body["container"]["logs"]
        .as_str()
        .unwrap()
        .contains("started"));
}

#[test]
fn add_user_over_http() {
    let (_server, client) = start();
    create(&client, "demo");

    let (status, body) = client.post(
        "/containers/demo/users",
        &json!({"username": "alice", "password": "hunter2"}),
    );
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["user"]["created"], true);

    let (status, body) = client.post("/containers/demo/users", &json!({"username": "alice"}));
    assert_error(status, &body, 500, "Internal");

    let (status, body) = client.post("/containers/demo/users", &json!({"password": "x"}));
    assert_error(status, &body, 400, "Validation");
}

#[test]
fn malformed_json_and_unknown_routes() {
    let (_server, client) = start();
    let (status, body) = client.post_raw("/containers", "{\"image\": ");
    assert_error(status, &body, 400, "Validation");

    let (status, body) = client.get("/nothing-here");
    assert_error(status, &body, 404, "NotFound");

    let (status, body) = client.delete("/health");
    assert_error(status, &body, 404, "NotFound");
}

#[test]
fn metrics_reflect_pool() {
    let (_server, client) = start();
    create(&client, "demo");
    let (status, body) = client.get("/metrics");
    assert_eq!(status, 200);
    let m = &body["metrics"];
    assert_eq!(m["max_workers"], 4);
    assert_eq!(m["state"], "active");
    assert!(m["completed"].as_u64().unwrap() >= 1);
    assert!(m["uptime_seconds"].is_u64());
    assert!(m["uptime_human"].is_string());
}

#[test]
fn concurrent_requests_respect_worker_ceiling() {
    let engine = Arc::new(MockEngine::new().with_exec_delay(Duration::from_millis(40)));
    let server = TestServer::start_with(engine, None).unwrap();
    let client = Client::new(&server.url);
    for i in 0..8 {
        create(&client, &format!("c{i}"));
    }

    let base = server.url.clone();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let base = base.clone();
            std::thread::spawn(move || {
                let client = Client::new(&base);
                client.post(&format!("/containers/c{i}/exec"), &json!({"command": "true"}))
            })
        })
        .collect();
    for h in handles {
        let (status, _) = h.join().unwrap();
        assert_eq!(status, 200);
    }

    let pool = server.dispatcher.metrics().pool;
    assert!(pool.peak_workers <= 4, "peak {}", pool.peak_workers);
}

#[test]
fn service_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("podgate.toml");
    std::fs::write(
        &path,
        "bind = \"127.0.0.1:0\"\nbackend = \"mock\"\nmax_workers = 2\nhttp_threads = 2\n",
    )
    .unwrap();
    let config = Config::load(Some(&path)).unwrap();
    config.validate().unwrap();

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(MockEngine::new()), &config).unwrap());
    let service = HttpService::bind(&config.bind, Arc::clone(&dispatcher), config.http_threads)
        .unwrap();
    let port = service.port().unwrap();
    let stop = service.stop_handle();
    let handle = std::thread::spawn(move || service.run());

    let client = Client::new(&format!("http://127.0.0.1:{port}/api/v1"));
    let (status, body) = client.get("/metrics");
    assert_eq!(status, 200);
    assert_eq!(body["metrics"]["max_workers"], 2);

    stop.stop();
    stop.stop();
    handle.join().unwrap();
    assert!(stop.is_stopping());
    dispatcher.shutdown();
}
