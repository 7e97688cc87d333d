//! In-process test backend for integration tests
//!
//! Implements a minimal tool-protocol server over the hybrid HTTP transport:
//! `GET /mcp_server/sse` opens the event stream (first event announces the
//! per-session message endpoint), `POST /messages/{sid}` accepts JSON-RPC
//! messages and pushes responses back onto that session's stream. It is used
//! exclusively by integration tests to exercise the client without a real
//! automation backend.
//!
//! # Handled Methods
//!
//! - `initialize` -- responds with the configured protocol version (default
//!   `"2025-03-26"`) and tool capabilities.
//! - `notifications/initialized` -- acknowledged silently.
//! - `tools/list` -- two pages: `turn_on_light` with cursor `"page-2"`, then
//!   `turn_off_light` and `get_temperature`.
//! - `tools/call` -- succeeds unless the arguments contain `"fail": true`
//!   (returns an `isError: true` result) or the tool name is `"explode"`
//!   (returns a JSON-RPC `-32000` error).
//! - `ping` -- empty result.
//! - All other methods -- JSON-RPC `-32601 Method not found`.
//!
//! # Fault injection
//!
//! Tests drive failure scenarios through the [`TestBackend`] handle:
//! `fail_next_posts` makes the next N POSTs return 401, `hold_responses`
//! parks computed responses until `release_held`, and `drop_sessions` ends
//! every open event stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use homelink::auth::TokenProvider;
use homelink::config::ClientConfig;
use homelink::error::Result;

pub const STREAM_PATH: &str = "/mcp_server/sse";

#[derive(Default)]
struct BackendState {
    /// When set, every request must carry `Authorization: Bearer <this>`.
    expected_token: Mutex<Option<String>>,
    /// Number of event streams ever opened; one per handshake.
    sse_connects: AtomicUsize,
    /// Next N POSTs are rejected with 401 regardless of token.
    fail_next_posts: Mutex<u32>,
    /// When true, computed responses are parked instead of delivered.
    hold_responses: AtomicBool,
    held: Mutex<Vec<(String, String)>>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    next_session: AtomicUsize,
    protocol_version: Mutex<Option<String>>,
}

/// Handle to a running in-process backend.
pub struct TestBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
}

#[allow(dead_code)]
impl TestBackend {
    pub async fn start() -> Self {
        // Honors RUST_LOG when a test needs client-side traces.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let state = Arc::new(BackendState::default());
        let app = Router::new()
            .route(STREAM_PATH, get(stream_handler))
            .route("/messages/:sid", post(message_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test backend");
        let addr = listener.local_addr().expect("failed to read local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test backend died");
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}", self.addr)).expect("invalid backend url")
    }

    /// Client config pointed at this backend with short test timeouts.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.base_url());
        config.request_timeout_secs = 2;
        config.tool_timeout_secs = 2;
        config
    }

    pub fn sse_connects(&self) -> usize {
        self.state.sse_connects.load(Ordering::SeqCst)
    }

    pub fn require_token(&self, token: Option<&str>) {
        *self.state.expected_token.lock().unwrap() = token.map(str::to_string);
    }

    pub fn fail_next_posts(&self, count: u32) {
        *self.state.fail_next_posts.lock().unwrap() = count;
    }

    pub fn hold_responses(&self, hold: bool) {
        self.state.hold_responses.store(hold, Ordering::SeqCst);
    }

    /// Deliver every parked response to its (still open) session.
    pub fn release_held(&self) {
        let held: Vec<_> = self.state.held.lock().unwrap().drain(..).collect();
        let sessions = self.state.sessions.lock().unwrap();
        for (sid, json) in held {
            if let Some(tx) = sessions.get(&sid) {
                let _ = tx.send(json);
            }
        }
    }

    /// End every open event stream, as if the server restarted.
    pub fn drop_sessions(&self) {
        self.state.sessions.lock().unwrap().clear();
    }

    /// Override the protocol version returned by `initialize`.
    pub fn set_protocol_version(&self, version: &str) {
        *self.state.protocol_version.lock().unwrap() = Some(version.to_string());
    }
}

fn authorized(state: &BackendState, headers: &HeaderMap) -> bool {
    let expected = state.expected_token.lock().unwrap();
    let Some(token) = expected.as_ref() else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {token}"))
        .unwrap_or(false)
}

async fn stream_handler(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, StatusCode>
{
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let sid = format!("s{}", state.next_session.fetch_add(1, Ordering::SeqCst));
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    state.sessions.lock().unwrap().insert(sid.clone(), tx);
    state.sse_connects.fetch_add(1, Ordering::SeqCst);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages/{sid}"));
    let messages =
        UnboundedReceiverStream::new(rx).map(|json| Event::default().event("message").data(json));
    let stream = stream::once(async move { endpoint })
        .chain(messages)
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(stream))
}

async fn message_handler(
    State(state): State<Arc<BackendState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    {
        let mut failures = state.fail_next_posts.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return StatusCode::UNAUTHORIZED;
        }
    }

    if let Some(response) = respond(&state, &body) {
        if state.hold_responses.load(Ordering::SeqCst) {
            state.held.lock().unwrap().push((sid, response));
        } else if let Some(tx) = state.sessions.lock().unwrap().get(&sid) {
            let _ = tx.send(response);
        }
    }

    StatusCode::ACCEPTED
}

/// Compute the JSON-RPC response for one inbound message, if any.
fn respond(state: &BackendState, body: &serde_json::Value) -> Option<String> {
    let method = body.get("method")?.as_str()?;
    let id = body.get("id").filter(|v| !v.is_null())?.clone();
    let params = body.get("params").cloned().unwrap_or(serde_json::Value::Null);

    let response = match method {
        "initialize" => {
            let version = state
                .protocol_version
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "2025-03-26".to_string());
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "homelink-test-backend", "version": "0.1.0" }
                }
            })
        }
        "tools/list" => {
            let cursor = params.get("cursor").and_then(|c| c.as_str());
            match cursor {
                None => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [{
                            "name": "turn_on_light",
                            "description": "Turn on a light by entity id",
                            "inputSchema": {
                                "type": "object",
                                "properties": { "entity_id": { "type": "string" } }
                            }
                        }],
                        "nextCursor": "page-2"
                    }
                }),
                Some("page-2") => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [
                            {
                                "name": "turn_off_light",
                                "inputSchema": { "type": "object" }
                            },
                            {
                                "name": "get_temperature",
                                "description": "Read a temperature sensor",
                                "inputSchema": { "type": "object" }
                            }
                        ]
                    }
                }),
                Some(other) => make_error(&id, -32602, &format!("unknown cursor: {other}")),
            }
        }
        "tools/call" => {
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("?");
            if name == "explode" {
                let response = make_error(&id, -32000, "internal backend failure");
                return Some(response.to_string());
            }
            let wants_failure = params
                .get("arguments")
                .and_then(|a| a.get("fail"))
                .and_then(|f| f.as_bool())
                .unwrap_or(false);
            if wants_failure {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": "device unreachable" }],
                        "isError": true
                    }
                })
            } else {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": format!("executed {name}") }],
                        "isError": false
                    }
                })
            }
        }
        "ping" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
        _ => make_error(&id, -32601, &format!("Method not found: {method}")),
    };

    Some(response.to_string())
}

fn make_error(id: &serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Token provider whose token can be rotated mid-test.
#[derive(Debug, Clone, Default)]
pub struct SwappableTokenProvider {
    token: Arc<RwLock<String>>,
}

#[allow(dead_code)]
impl SwappableTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.to_string())),
        }
    }

    pub fn set(&self, token: &str) {
        *self.token.write().unwrap() = token.to_string();
    }
}

#[async_trait]
impl TokenProvider for SwappableTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.read().unwrap().clone())
    }
}
