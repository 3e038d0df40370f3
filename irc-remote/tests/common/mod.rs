//! In-process fake of the remote connection service.
//!
//! Serves the snapshot and open endpoints plus the `/_irc/ws` channel on
//! 127.0.0.1:0, and records everything it receives.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use irc_remote::IrcServer;
use irc_remote::config::RemoteConfig;

pub const TOKEN: &str = "test-token";
/// Pushed text that makes the fake close the channel instead of relaying.
const CLOSE_MARKER: &str = "\u{0}close";
const TIMEOUT_MS: u64 = 5000;

pub struct FakeState {
    token: String,
    /// domain → connections reported by the snapshot endpoint
    snapshots: Mutex<HashMap<String, Vec<Value>>>,
    failing_snapshots: Mutex<HashSet<String>>,
    /// (domain, body) of every open request, in arrival order
    pub open_requests: Mutex<Vec<(String, Value)>>,
    pub fail_open: AtomicBool,
    pub open_delay_ms: AtomicUsize,
    pub reject_channel: AtomicBool,
    /// Delay before the channel upgrade is answered.
    pub channel_delay_ms: AtomicUsize,
    pub snapshot_requests: AtomicUsize,
    pub channel_connects: AtomicUsize,
    /// Frames received on the channel, in arrival order.
    pub frames: Mutex<Vec<Value>>,
    push: broadcast::Sender<String>,
    next_id: AtomicUsize,
}

pub struct FakeService {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeService {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(FakeState {
            token: TOKEN.to_string(),
            snapshots: Mutex::new(HashMap::new()),
            failing_snapshots: Mutex::new(HashSet::new()),
            open_requests: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
            open_delay_ms: AtomicUsize::new(0),
            reject_channel: AtomicBool::new(false),
            channel_delay_ms: AtomicUsize::new(0),
            snapshot_requests: AtomicUsize::new(0),
            channel_connects: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
            push,
            next_id: AtomicUsize::new(1),
        });

        let app = Router::new()
            .route("/_irc/connections/{domain}", get(snapshot))
            .route("/_irc/connections/{domain}/open", post(open))
            .route("/_irc/ws", get(channel_upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    pub fn config(&self) -> RemoteConfig {
        RemoteConfig::new(format!("http://{}", self.addr), TOKEN)
    }

    /// Add an existing connection to a server's snapshot.
    pub fn add_connection(&self, domain: &str, id: &str, nick: &str) {
        self.state
            .snapshots
            .lock()
            .entry(domain.to_string())
            .or_default()
            .push(json!({ "id": id, "nick": nick, "state": "connected" }));
    }

    /// Make the snapshot endpoint answer 500 for `domain`.
    pub fn fail_snapshot(&self, domain: &str) {
        self.state.failing_snapshots.lock().insert(domain.to_string());
    }

    /// Wait until a channel client is attached and able to receive pushes.
    pub async fn wait_for_channel(&self) {
        wait_until(|| self.state.push.receiver_count() > 0, "channel client").await;
    }

    /// Push a text frame to every connected channel client.
    pub fn push(&self, text: &str) {
        let _ = self.state.push.send(text.to_string());
    }

    /// Close every channel connection from the service side.
    pub fn close_channels(&self) {
        self.push(CLOSE_MARKER);
    }

    pub fn open_count(&self) -> usize {
        self.state.open_requests.lock().len()
    }

    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().clone()
    }

    pub fn channel_connects(&self) -> usize {
        self.state.channel_connects.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` channel frames have arrived.
    pub async fn wait_for_frames(&self, n: usize) -> Vec<Value> {
        wait_until(|| self.state.frames.lock().len() >= n, &format!("{n} frames")).await;
        self.frames()
    }
}

/// Poll `check` until it holds or the test timeout passes.
pub async fn wait_until(check: impl Fn() -> bool, desc: &str) {
    let start = tokio::time::Instant::now();
    while !check() {
        if start.elapsed() > Duration::from_millis(TIMEOUT_MS) {
            panic!("Timeout waiting for: {desc}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn server(domain: &str) -> Arc<IrcServer> {
    Arc::new(IrcServer::new(domain))
}

fn authorized(state: &FakeState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.token);
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn snapshot(
    State(state): State<Arc<FakeState>>,
    Path(domain): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.snapshot_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if query.get("detail").map(String::as_str) != Some("state") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if state.failing_snapshots.lock().contains(&domain) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "snapshot unavailable").into_response();
    }
    let connections = state.snapshots.lock().get(&domain).cloned().unwrap_or_default();
    Json(json!({ "connections": connections })).into_response()
}

async fn open(
    State(state): State<Arc<FakeState>>,
    Path(domain): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.open_requests.lock().push((domain, body));

    let delay = state.open_delay_ms.load(Ordering::SeqCst) as u64;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.fail_open.load(Ordering::SeqCst) {
        return (StatusCode::BAD_GATEWAY, "irc server unreachable").into_response();
    }
    let n = state.next_id.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "id": format!("new-{n}") })).into_response()
}

async fn channel_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
) -> Response {
    let delay = state.channel_delay_ms.load(Ordering::SeqCst) as u64;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if !authorized(&state, &headers) || state.reject_channel.load(Ordering::SeqCst) {
        return StatusCode::FORBIDDEN.into_response();
    }
    state.channel_connects.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| handle_channel(socket, state))
}

async fn handle_channel(mut socket: WebSocket, state: Arc<FakeState>) {
    let mut push = state.push.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let value = serde_json::from_str(text.as_str())
                        .unwrap_or_else(|_| Value::String(text.to_string()));
                    state.frames.lock().push(value);
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = push.recv() => match out {
                Ok(text) if text == CLOSE_MARKER => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
                Ok(text) => {
                    if socket.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}
