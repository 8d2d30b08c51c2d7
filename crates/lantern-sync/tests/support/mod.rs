#![allow(dead_code)]

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use lantern_core::phoenix::{
    PhoenixMessage, EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, EVENT_REPLY,
};
use lantern_sync::config::SyncConfig;
use lantern_sync::store::Store;
use lantern_sync::SyncContext;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

struct MockState {
    projects: Mutex<Vec<Value>>,
    services: Mutex<Vec<Value>>,
    failures: Mutex<HashMap<String, (u16, Value)>>,
    action_delay: Mutex<Duration>,
    requests: Mutex<Vec<String>>,
    frames: Mutex<Vec<(String, String)>>,
    joins: Mutex<Vec<(String, Option<String>)>>,
    heartbeat_replies: AtomicBool,
    pushes: broadcast::Sender<String>,
    drops: broadcast::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// In-process stand-in for the daemon: JSON API plus a Phoenix socket that
/// acknowledges joins and heartbeats and relays pushes.
pub struct MockDaemon {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockDaemon {
    pub async fn start(projects: Vec<Value>, services: Vec<Value>) -> Self {
        let (pushes, _) = broadcast::channel(64);
        let (drops, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            projects: Mutex::new(projects),
            services: Mutex::new(services),
            failures: Mutex::new(HashMap::new()),
            action_delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
            heartbeat_replies: AtomicBool::new(true),
            pushes,
            drops,
        });

        let app = Router::new()
            .route("/api/projects", get(list_projects))
            .route(
                "/api/projects/:name",
                post(scan_projects).patch(patch_project).delete(delete_project),
            )
            .route(
                "/api/projects/:name/:verb",
                get(one_project_health).post(project_action),
            )
            .route("/api/projects/:name/:verb/:sub", post(check_project_health))
            .route("/api/services", get(list_services))
            .route("/api/services/:name/:verb", post(service_action))
            .route("/api/system/health", get(system_health))
            .route("/api/health", get(project_health))
            .route("/api/system/shutdown", post(shutdown))
            .route("/socket/websocket", get(socket_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock daemon");
        let addr = listener.local_addr().expect("mock addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            state,
            server,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("mock url")
    }

    pub fn config(&self) -> SyncConfig {
        SyncConfig::new(self.url())
    }

    pub fn context(&self) -> SyncContext {
        SyncContext::new(self.config(), Store::new()).expect("context")
    }

    /// Makes the next `<verb>` on `name` fail with `status` and `body`.
    pub fn fail_next(&self, verb: &str, name: &str, status: u16, body: Value) {
        lock(&self.state.failures).insert(format!("{verb}:{name}"), (status, body));
    }

    pub fn set_action_delay(&self, delay: Duration) {
        *lock(&self.state.action_delay) = delay;
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.state.requests).clone()
    }

    pub fn frames(&self) -> Vec<(String, String)> {
        lock(&self.state.frames).clone()
    }

    pub fn saw_frame(&self, topic: &str, event: &str) -> bool {
        lock(&self.state.frames)
            .iter()
            .any(|(t, e)| t == topic && e == event)
    }

    /// Join refs of every `phx_join` seen for `topic`, oldest first.
    pub fn join_refs(&self, topic: &str) -> Vec<Option<String>> {
        lock(&self.state.joins)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, join_ref)| join_ref.clone())
            .collect()
    }

    pub fn count_requests(&self, request: &str) -> usize {
        lock(&self.state.requests)
            .iter()
            .filter(|r| r.as_str() == request)
            .count()
    }

    pub fn project_names(&self) -> Vec<String> {
        lock(&self.state.projects)
            .iter()
            .filter_map(|p| p["name"].as_str().map(str::to_string))
            .collect()
    }

    /// Stops answering heartbeats, so the client sees its socket as dead.
    pub fn set_heartbeat_replies(&self, enabled: bool) {
        self.state.heartbeat_replies.store(enabled, Ordering::SeqCst);
    }

    /// Closes every open socket from the server side.
    pub fn drop_sockets(&self) {
        let _ = self.state.drops.send(());
    }

    /// Broadcasts a server push to every connected socket.
    pub fn push(&self, topic: &str, event: &str, payload: Value) {
        self.push_with_join_ref(topic, event, payload, None);
    }

    pub fn push_with_join_ref(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
        join_ref: Option<String>,
    ) {
        let message = PhoenixMessage {
            join_ref,
            msg_ref: None,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        let text = message.encode().expect("encode push");
        let _ = self.state.pushes.send(text);
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn project(name: &str, status: &str) -> Value {
    json!({
        "name": name,
        "path": format!("/srv/{name}"),
        "domain": format!("{name}.test"),
        "type": "php",
        "status": status,
        "port": null
    })
}

pub fn service(name: &str, status: &str) -> Value {
    json!({"name": name, "status": status, "ports": {}})
}

/// Polls `check` every 20 ms for up to five seconds.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn list_projects(State(state): State<Arc<MockState>>) -> Json<Value> {
    lock(&state.requests).push("GET projects".to_string());
    let projects = lock(&state.projects).clone();
    Json(json!({ "data": projects }))
}

async fn list_services(State(state): State<Arc<MockState>>) -> Json<Value> {
    lock(&state.requests).push("GET services".to_string());
    let services = lock(&state.services).clone();
    Json(json!({ "data": services }))
}

async fn system_health() -> Json<Value> {
    Json(json!({
        "data": {
            "dns": {"status": "ok", "message": ""},
            "caddy": {"status": "ok", "message": ""}
        }
    }))
}

async fn project_health() -> Json<Value> {
    Json(json!({ "data": {} }))
}

fn injected_failure(state: &MockState, key: &str) -> Option<Response> {
    let (status, body) = lock(&state.failures).remove(key)?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Some((status, Json(body)).into_response())
}

fn not_found(kind: &str, name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": format!("{kind} {name} not found")})),
    )
        .into_response()
}

async fn scan_projects(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
) -> Response {
    if name != "scan" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    lock(&state.requests).push("POST scan".to_string());
    if let Some(response) = injected_failure(&state, "scan:") {
        return response;
    }
    let projects = lock(&state.projects).clone();
    Json(json!({ "data": projects })).into_response()
}

async fn patch_project(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
    Json(update): Json<Value>,
) -> Response {
    lock(&state.requests).push(format!("PATCH {name}"));
    if let Some(response) = injected_failure(&state, &format!("patch:{name}")) {
        return response;
    }
    let updated = {
        let mut projects = lock(&state.projects);
        projects.iter_mut().find(|p| p["name"] == name).map(|p| {
            if let Some(new_name) = update.get("new_name").and_then(Value::as_str) {
                p["name"] = json!(new_name);
                p["domain"] = json!(format!("{new_name}.test"));
            }
            if let Some(enabled) = update.get("enabled").and_then(Value::as_bool) {
                p["enabled"] = json!(enabled);
            }
            p.clone()
        })
    };
    match updated {
        Some(project) => Json(json!({ "data": project })).into_response(),
        None => not_found("project", &name),
    }
}

async fn delete_project(
    State(state): State<Arc<MockState>>,
    Path(name): Path<String>,
) -> Response {
    lock(&state.requests).push(format!("DELETE {name}"));
    if let Some(response) = injected_failure(&state, &format!("delete:{name}")) {
        return response;
    }
    let removed = {
        let mut projects = lock(&state.projects);
        let before = projects.len();
        projects.retain(|p| p["name"] != name);
        projects.len() != before
    };
    if !removed {
        return not_found("project", &name);
    }
    Json(json!({ "data": {"deleted": name} })).into_response()
}

fn health_report(latency_ms: u64) -> Value {
    json!({
        "status": "healthy",
        "latency_ms": latency_ms,
        "checked_at": "2026-03-01T10:00:00Z",
        "history": []
    })
}

async fn one_project_health(
    State(state): State<Arc<MockState>>,
    Path((name, verb)): Path<(String, String)>,
) -> Response {
    if verb != "health" {
        return StatusCode::NOT_FOUND.into_response();
    }
    lock(&state.requests).push(format!("GET health {name}"));
    Json(json!({ "data": health_report(12) })).into_response()
}

async fn check_project_health(
    State(state): State<Arc<MockState>>,
    Path((name, verb, sub)): Path<(String, String, String)>,
) -> Response {
    if verb != "health" || sub != "check" {
        return StatusCode::NOT_FOUND.into_response();
    }
    lock(&state.requests).push(format!("POST health check {name}"));
    if let Some(response) = injected_failure(&state, &format!("health_check:{name}")) {
        return response;
    }
    Json(json!({ "data": health_report(7) })).into_response()
}

async fn shutdown(State(state): State<Arc<MockState>>) -> Json<Value> {
    lock(&state.requests).push("POST shutdown".to_string());
    Json(json!({ "data": {"status": "shutting_down"} }))
}

async fn project_action(
    State(state): State<Arc<MockState>>,
    Path((name, verb)): Path<(String, String)>,
) -> Response {
    lock(&state.requests).push(format!("POST {verb} {name}"));
    let delay = *lock(&state.action_delay);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if let Some(response) = injected_failure(&state, &format!("{verb}:{name}")) {
        return response;
    }
    let status = match verb.as_str() {
        "activate" | "restart" => "running",
        "deactivate" => "stopped",
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let updated = {
        let mut projects = lock(&state.projects);
        projects
            .iter_mut()
            .find(|p| p["name"] == name)
            .map(|p| {
                p["status"] = json!(status);
                p.clone()
            })
    };
    match updated {
        Some(project) => Json(json!({ "data": project })).into_response(),
        None => not_found("project", &name),
    }
}

async fn service_action(
    State(state): State<Arc<MockState>>,
    Path((name, verb)): Path<(String, String)>,
) -> Response {
    lock(&state.requests).push(format!("POST service {verb} {name}"));
    if let Some(response) = injected_failure(&state, &format!("service_{verb}:{name}")) {
        return response;
    }
    let status = match verb.as_str() {
        "start" => "running",
        "stop" => "stopped",
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let updated = {
        let mut services = lock(&state.services);
        services
            .iter_mut()
            .find(|s| s["name"] == name)
            .map(|s| {
                s["status"] = json!(status);
                s.clone()
            })
    };
    match updated {
        Some(service) => Json(json!({ "data": service })).into_response(),
        None => not_found("service", &name),
    }
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<MockState>) {
    let (mut sink, mut stream) = socket.split();
    let mut pushes = state.pushes.subscribe();
    let mut drops = state.drops.subscribe();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                let Message::Text(text) = message else {
                    continue;
                };
                let Ok(frame) = PhoenixMessage::decode(&text) else {
                    continue;
                };
                lock(&state.frames).push((frame.topic.clone(), frame.event.clone()));
                if frame.event == EVENT_JOIN {
                    lock(&state.joins).push((frame.topic.clone(), frame.join_ref.clone()));
                }
                if frame.event == EVENT_HEARTBEAT
                    && !state.heartbeat_replies.load(Ordering::SeqCst)
                {
                    continue;
                }
                let acknowledged = [EVENT_JOIN, EVENT_LEAVE, EVENT_HEARTBEAT];
                if !acknowledged.contains(&frame.event.as_str()) {
                    continue;
                }
                let reply = PhoenixMessage {
                    join_ref: frame.join_ref.clone(),
                    msg_ref: frame.msg_ref.clone(),
                    topic: frame.topic.clone(),
                    event: EVENT_REPLY.to_string(),
                    payload: json!({"status": "ok", "response": {}}),
                };
                let Ok(text) = reply.encode() else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            pushed = pushes.recv() => {
                let Ok(text) = pushed else {
                    continue;
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = drops.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
