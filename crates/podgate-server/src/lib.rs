//! HTTP transport for podgate.
//!
//! Routes live under `/api/v1`. Every response is a JSON envelope:
//! `{"success": true, "<key>": payload, "timestamp": ...}` on success and
//! `{"success": false, "error": {message, code, type}, "timestamp": ...}` on
//! failure, with the HTTP status equal to the error code.
//!
//! [`HttpService`] runs a fixed number of acceptor threads over one
//! `tiny_http` listener; [`TestServer`] starts one on a random port backed by
//! the mock engine for integration testing.

use chrono::{SecondsFormat, Utc};
use podgate_core::{
    ApiError, BridgeError, Config, ConfigError, CreateRequest, Dispatcher, ExecRequest,
    FileRequest, UserRequest,
};
use podgate_engine::{EngineError, MockEngine};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

pub const API_PREFIX: &str = "/api/v1";

/// Request bodies larger than this are rejected.
pub const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    CreateContainer,
    ListContainers,
    Start(&'a str),
    Stop(&'a str),
    Remove(&'a str),
    Logs(&'a str),
    AddUser(&'a str),
    AddFile(&'a str),
    Exec(&'a str),
    Health,
    Metrics,
}

/// Match a request path (without query string) onto a route.
pub fn parse_route<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let rest = path.strip_prefix(API_PREFIX)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let segments: Vec<&'a str> = rest
        .trim_end_matches('/')
        .split('/')
        .skip(1)
        .collect();

    let route = match (method, segments.as_slice()) {
        (Method::Post, ["containers"]) => Route::CreateContainer,
        (Method::Get, ["containers"]) => Route::ListContainers,
        (Method::Post, ["containers", name, "start"]) => Route::Start(*name),
        (Method::Post, ["containers", name, "stop"]) => Route::Stop(*name),
        (Method::Delete, ["containers", name]) => Route::Remove(*name),
        (Method::Get, ["containers", name, "logs"]) => Route::Logs(*name),
        (Method::Post, ["containers", name, "users"]) => Route::AddUser(*name),
        (Method::Post, ["containers", name, "files"]) => Route::AddFile(*name),
        (Method::Post, ["containers", name, "exec"]) => Route::Exec(*name),
        (Method::Get, ["health"]) => Route::Health,
        (Method::Get, ["metrics"]) => Route::Metrics,
        _ => return None,
    };
    Some(route)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn split_url(url: &str) -> (&str, &str) {
    url.split_once('?').unwrap_or((url, ""))
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

fn query_flag(
    query: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ApiError> {
    match query.get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "" | "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ApiError::validation(format!(
                "query parameter '{key}' must be true or false"
            ))),
        },
    }
}

fn query_count(query: &HashMap<String, String>, key: &str) -> Result<Option<usize>, ApiError> {
    query
        .get(key)
        .map(|v| {
            v.parse().map_err(|_| {
                ApiError::validation(format!(
                    "query parameter '{key}' must be a non-negative integer"
                ))
            })
        })
        .transpose()
}

/// Status code plus JSON envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Reply {
    pub fn ok<T: Serialize>(key: &str, payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => {
                let mut body = Map::new();
                body.insert("success".to_owned(), Value::Bool(true));
                body.insert(key.to_owned(), value);
                body.insert("timestamp".to_owned(), Value::String(timestamp()));
                Self {
                    status: 200,
                    body: Value::Object(body),
                }
            }
            Err(e) => {
                error!("failed to serialize {key} payload: {e}");
                Self::error(&ApiError::internal("failed to render response"))
            }
        }
    }

    pub fn error(err: &ApiError) -> Self {
        let mut body = Map::new();
        body.insert("success".to_owned(), Value::Bool(false));
        body.insert(
            "error".to_owned(),
            serde_json::to_value(err).unwrap_or(Value::Null),
        );
        body.insert("timestamp".to_owned(), Value::String(timestamp()));
        Self {
            status: err.code,
            body: Value::Object(body),
        }
    }

    pub fn from_result<T: Serialize>(key: &str, result: Result<T, ApiError>) -> Self {
        match result {
            Ok(payload) => Self::ok(key, &payload),
            Err(e) => Self::error(&e),
        }
    }
}

/// Errors raised by the transport itself, before any dispatcher is involved.
fn transport_error(err: &ApiError) -> Reply {
    warn!("request rejected: {}", err.message);
    Reply::error(err)
}

fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("malformed JSON body: {e}")))
}

fn with_body<T, R>(key: &str, body: &[u8], op: impl FnOnce(T) -> Result<R, ApiError>) -> Reply
where
    T: DeserializeOwned + Default,
    R: Serialize,
{
    match parse_body(body) {
        Ok(request) => Reply::from_result(key, op(request)),
        Err(e) => transport_error(&e),
    }
}

/// Route one request to the dispatcher and build its reply.
pub fn route_request(dispatcher: &Dispatcher, method: &Method, url: &str, body: &[u8]) -> Reply {
    let (path, query) = split_url(url);
    let Some(route) = parse_route(method, path) else {
        return transport_error(&ApiError::not_found(format!("no route for {method} {path}")));
    };
    let query = parse_query(query);

    match route {
        Route::CreateContainer => {
            with_body("container", body, |req: CreateRequest| dispatcher.create(req))
        }
        Route::ListContainers => match query_flag(&query, "all", true) {
            Ok(all) => Reply::from_result("containers", dispatcher.list(all)),
            Err(e) => transport_error(&e),
        },
        Route::Start(name) => Reply::from_result("container", dispatcher.start(name)),
        Route::Stop(name) => Reply::from_result("container", dispatcher.stop(name)),
        Route::Remove(name) => match query_flag(&query, "force", false) {
            Ok(force) => Reply::from_result("container", dispatcher.remove(name, force)),
            Err(e) => transport_error(&e),
        },
        Route::Logs(name) => match query_count(&query, "tail") {
            Ok(tail) => Reply::from_result("container", dispatcher.logs(name, tail)),
            Err(e) => transport_error(&e),
        },
        Route::AddUser(name) => {
            with_body("user", body, |req: UserRequest| dispatcher.add_user(name, req))
        }
        Route::AddFile(name) => {
            with_body("file", body, |req: FileRequest| dispatcher.add_file(name, req))
        }
        Route::Exec(name) => {
            with_body("execution", body, |req: ExecRequest| dispatcher.exec(name, req))
        }
        Route::Health => Reply::from_result("health", dispatcher.health()),
        Route::Metrics => Reply::ok("metrics", &dispatcher.metrics()),
    }
}

fn read_body(req: &mut Request) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    req.as_reader()
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(|e| ApiError::validation(format!("cannot read request body: {e}")))?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Err(ApiError::validation(format!(
            "request body exceeds {MAX_BODY_BYTES} bytes"
        )));
    }
    Ok(body)
}

fn respond(req: Request, reply: &Reply) {
    let data = serde_json::to_vec(&reply.body).unwrap_or_default();
    let mut response = Response::from_data(data).with_status_code(StatusCode(reply.status));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    if let Err(e) = req.respond(response) {
        debug!("failed to send response: {e}");
    }
}

/// Handle a single HTTP request end to end.
pub fn handle_request(dispatcher: &Dispatcher, mut req: Request) {
    let started = Instant::now();
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let reply = match read_body(&mut req) {
        Ok(body) => route_request(dispatcher, &method, &url, &body),
        Err(e) => transport_error(&e),
    };
    info!(
        "{method} {} -> {} in {:?}",
        split_url(&url).0,
        reply.status,
        started.elapsed()
    );
    respond(req, &reply);
}

/// Stops an [`HttpService`] from another thread. Safe to call repeatedly.
#[derive(Clone)]
pub struct StopHandle {
    server: Arc<Server>,
    threads: usize,
    stopping: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping HTTP acceptors");
        // Each unblock releases one thread waiting in `recv`.
        for _ in 0..self.threads {
            self.server.unblock();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

pub struct HttpService {
    server: Arc<Server>,
    dispatcher: Arc<Dispatcher>,
    threads: usize,
    stopping: Arc<AtomicBool>,
}

fn accept_loop(server: &Server, dispatcher: &Dispatcher, stopping: &AtomicBool) {
    loop {
        match server.recv() {
            Ok(req) => handle_request(dispatcher, req),
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!("failed to accept request: {e}");
            }
        }
    }
}

impl HttpService {
    pub fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        threads: usize,
    ) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            server: Arc::new(server),
            dispatcher,
            threads: threads.max(1),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> Option<u16> {
        self.server.server_addr().to_ip().map(|a| a.port())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            server: Arc::clone(&self.server),
            threads: self.threads,
            stopping: Arc::clone(&self.stopping),
        }
    }

    /// Serve until [`StopHandle::stop`] is called. Blocks the current thread.
    pub fn run(self) {
        info!(
            "serving {API_PREFIX} with {} acceptor threads",
            self.threads
        );
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.threads);
        for index in 0..self.threads {
            let server = Arc::clone(&self.server);
            let dispatcher = Arc::clone(&self.dispatcher);
            let stopping = Arc::clone(&self.stopping);
            let spawned = std::thread::Builder::new()
                .name(format!("podgate-http-{index}"))
                .spawn(move || accept_loop(&server, &dispatcher, &stopping));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("failed to spawn acceptor thread {index}: {e}"),
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
        info!("HTTP service stopped");
    }
}

/// A podgate server on `127.0.0.1:{random port}` backed by a [`MockEngine`].
///
/// Dropping it stops the acceptors and drains the worker pool.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub engine: Arc<MockEngine>,
    pub dispatcher: Arc<Dispatcher>,
    stop: StopHandle,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Result<Self, ServerError> {
        Self::start_with(Arc::new(MockEngine::new()), None)
    }

    /// Start with a prepared engine and, optionally, a shorter request timeout.
    pub fn start_with(
        engine: Arc<MockEngine>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ServerError> {
        let config = Config {
            max_workers: 4,
            http_threads: 4,
            backend: "mock".to_owned(),
            ..Config::default()
        };
        let mut dispatcher = Dispatcher::new(engine.clone(), &config)?
            .with_drain_timeout(Duration::from_secs(2));
        if let Some(timeout) = request_timeout {
            dispatcher = dispatcher.with_request_timeout(timeout);
        }
        let dispatcher = Arc::new(dispatcher);

        let service = HttpService::bind("127.0.0.1:0", Arc::clone(&dispatcher), config.http_threads)?;
        let port = service.port().ok_or_else(|| ServerError::Bind {
            addr: "127.0.0.1:0".to_owned(),
            reason: "listener has no IP address".to_owned(),
        })?;
        let stop = service.stop_handle();
        let handle = std::thread::spawn(move || service.run());

        Ok(Self {
            url: format!("http://127.0.0.1:{port}{API_PREFIX}"),
            port,
            engine,
            dispatcher,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.dispatcher.shutdown();
    }
}
