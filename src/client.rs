//! Protocol client orchestrator
//!
//! [`McpClient`] is the public surface of the crate: connect, list tools,
//! call a tool, shut down. It owns the connection state machine and composes
//! the transport ([`crate::transport`]), the pending-request table
//! ([`crate::pending`]), the outbound dispatcher ([`crate::dispatch`]), and
//! the reconnection coordinator implemented here.
//!
//! # Concurrency model
//!
//! One long-lived reader task consumes the inbound event stream and is the
//! only writer of stream-derived state (session endpoint, connection state)
//! outside the mutex-guarded reconnect path. Arbitrarily many short-lived
//! callers issue `list_tools`/`call_tool` concurrently; a caller that
//! observes a dead connection suspends behind the reconnect mutex, re-checks
//! aliveness after acquiring it (another caller may already have repaired
//! the connection), and only then performs teardown plus a full reconnect.
//! The triggering message is re-sent exactly once after the mutex is
//! released.
//!
//! Server-initiated requests and notifications other than the endpoint
//! announcement are logged and dropped; this is a deliberate, unimplemented
//! extension point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::error::{HomelinkError, Result};
use crate::pending::{FailureCause, PendingRequests};
use crate::transport::{SseConnection, StreamEvent};
use crate::types::{
    CallToolParams, ClientCapabilities, Implementation, InitializeParams, InitializeResponse,
    JsonRpcError, ListToolsResponse, PaginatedParams, Tool, ToolCallResult, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Connection lifecycle state. Exactly one value holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection. Initial state, and the state after transport death.
    Disconnected,
    /// Stream opening / waiting for the session endpoint.
    Connecting,
    /// Stream open and endpoint received; handshake not yet complete.
    Open,
    /// Handshake complete; requests may be issued.
    Initialized,
    /// Shut down, or rolled back after a failed connect. Terminal until the
    /// application calls `connect` again.
    Closed,
}

/// Reader task handle for the current connection generation.
#[derive(Debug)]
struct ReaderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Tool-protocol client for the automation backend.
///
/// Created once per logical session by the surrounding application and
/// discarded after [`shutdown`]. Cheap to share behind an `Arc`; all public
/// operations take `&self`.
///
/// [`shutdown`]: McpClient::shutdown
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use homelink::auth::StaticTokenProvider;
/// use homelink::client::McpClient;
/// use homelink::config::ClientConfig;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ClientConfig::new(url::Url::parse("http://homelink.local:8123")?);
///     let client = McpClient::new(config, Arc::new(StaticTokenProvider::new("token")))?;
///
///     client.connect().await?;
///     let tools = client.list_tools().await?;
///     println!("{} tools available", tools.len());
///     client.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct McpClient {
    config: ClientConfig,
    tokens: Arc<dyn TokenProvider>,
    connection: SseConnection,
    dispatcher: Dispatcher,
    state: Arc<RwLock<ConnectionState>>,
    /// Session-specific POST path, shared with the dispatcher.
    endpoint: Arc<RwLock<Option<String>>>,
    pending: Arc<PendingRequests>,
    /// Per-generation request id counter, shared with the dispatcher.
    next_id: Arc<AtomicU64>,
    /// Number of generations that reached Open; zero means connect() was
    /// never performed.
    generation: AtomicU64,
    /// Server identity from the most recent successful handshake.
    server_info: RwLock<Option<InitializeResponse>>,
    /// Reconnection coordinator: guards reset + reconnect.
    reconnect: Mutex<()>,
    reader: Mutex<Option<ReaderHandle>>,
}

impl McpClient {
    /// Build a client. No network I/O happens until [`connect`].
    ///
    /// [`connect`]: McpClient::connect
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed or the
    /// configured stream path does not resolve against the base URL.
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        // No client-wide timeout: it would kill the long-lived event stream.
        // POSTs get a per-request timeout in the dispatcher instead.
        let http = Arc::new(
            reqwest::Client::builder()
                .connect_timeout(config.connect_timeout())
                .build()?,
        );

        let stream_url = config.base_url.join(&config.sse_path).map_err(|e| {
            anyhow::anyhow!(HomelinkError::Connection(format!(
                "invalid stream path {:?}: {e}",
                config.sse_path
            )))
        })?;

        let endpoint = Arc::new(RwLock::new(None));
        let pending = Arc::new(PendingRequests::new());
        let next_id = Arc::new(AtomicU64::new(1));

        let dispatcher = Dispatcher::new(
            Arc::clone(&http),
            config.base_url.clone(),
            Arc::clone(&endpoint),
            Arc::clone(&pending),
            Arc::clone(&next_id),
            Arc::clone(&tokens),
            config.request_timeout(),
        );
        let connection = SseConnection::new(Arc::clone(&http), stream_url);

        Ok(Self {
            config,
            tokens,
            connection,
            dispatcher,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            endpoint,
            pending,
            next_id,
            generation: AtomicU64::new(0),
            server_info: RwLock::new(None),
            reconnect: Mutex::new(()),
            reader: Mutex::new(None),
        })
    }

    /// Current connection state snapshot.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server identity from the most recent handshake, if any.
    pub async fn server_info(&self) -> Option<InitializeResponse> {
        self.server_info.read().await.clone()
    }

    /// Open the stream, await the session endpoint, and perform the
    /// initialize handshake.
    ///
    /// Valid from `Disconnected` and `Closed`. On failure the client rolls
    /// back to `Closed`, releasing any partially opened resources.
    ///
    /// # Errors
    ///
    /// Returns [`HomelinkError::Connection`] when the stream never opens or
    /// the endpoint never arrives, and [`HomelinkError::Handshake`] when the
    /// server rejects or mangles the `initialize` exchange.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.reconnect.lock().await;

        let state = *self.state.read().await;
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Err(anyhow::anyhow!(HomelinkError::IllegalState(format!(
                "connect() is not valid in state {state:?}"
            ))));
        }

        self.establish().await
    }

    /// List every callable tool, following cursor pagination.
    ///
    /// Requires `Initialized` (fails fast with `IllegalState` otherwise,
    /// never touching the network). A server JSON-RPC error surfaces as
    /// [`HomelinkError::Protocol`].
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match cursor.take() {
                Some(c) => Some(serde_json::to_value(PaginatedParams { cursor: Some(c) })?),
                None => None,
            };
            let value = self
                .request_with_retry(METHOD_TOOLS_LIST, params, self.config.request_timeout())
                .await?;
            let page: ListToolsResponse = serde_json::from_value(value)?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Invoke a named tool with the extended tool-execution deadline.
    ///
    /// A result with `is_error = true` is returned as a value, not an error:
    /// it is the backend reporting a tool failure, which the caller's retry
    /// policy treats differently from a transport fault.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<ToolCallResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let value = self
            .request_with_retry(METHOD_TOOLS_CALL, Some(params), self.config.tool_timeout())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Keepalive round-trip.
    pub async fn ping(&self) -> Result<()> {
        let _ = self
            .request_with_retry(METHOD_PING, None, self.config.request_timeout())
            .await?;
        Ok(())
    }

    /// Transition to `Closed`, cancel the reader, and fail all pending
    /// requests with `ConnectionClosed`.
    ///
    /// Idempotent, and never a source of failure: cleanup problems are
    /// logged, not propagated.
    pub async fn shutdown(&self) {
        let _guard = self.reconnect.lock().await;

        if *self.state.read().await == ConnectionState::Closed {
            return;
        }
        *self.state.write().await = ConnectionState::Closed;
        self.teardown(FailureCause::ConnectionClosed).await;
        tracing::debug!("protocol client shut down");
    }

    // -----------------------------------------------------------------------
    // Send path with single-attempt recovery
    // -----------------------------------------------------------------------

    /// Send `method`, transparently repairing a dead connection once.
    ///
    /// Fast path: connection alive, send directly; a 401 marks it dead and
    /// falls through. Slow path: acquire the reconnect mutex, re-check
    /// aliveness, reset + reconnect if still dead, release the mutex, then
    /// re-send the triggering message exactly once.
    async fn request_with_retry(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        self.require_ready().await?;

        if self.is_alive().await {
            match self.dispatcher.request(method, params.clone(), timeout).await {
                Err(e) if HomelinkError::is_unauthorized(&e) => {
                    tracing::debug!(method, "unauthorized response; connection needs a fresh start");
                    self.mark_dead().await;
                }
                other => return other,
            }
        }

        {
            let _guard = self.reconnect.lock().await;
            // Bind before matching so the read guard is released here;
            // matching on the lock expression directly would keep the guard
            // alive across reset()/establish(), which take the write half.
            let state = *self.state.read().await;
            match state {
                // Another caller repaired the connection while we waited.
                ConnectionState::Initialized => {}
                ConnectionState::Disconnected => {
                    self.reset().await;
                    self.establish().await?;
                }
                ConnectionState::Closed => {
                    return Err(anyhow::anyhow!(HomelinkError::ConnectionClosed));
                }
                state => {
                    return Err(anyhow::anyhow!(HomelinkError::IllegalState(format!(
                        "cannot send in state {state:?}"
                    ))));
                }
            }
        }

        match self.dispatcher.request(method, params, timeout).await {
            Err(e) if HomelinkError::is_unauthorized(&e) => {
                // Single-attempt policy: a 401 on the retry surfaces.
                self.mark_dead().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Fail fast unless the client is usable for sends.
    async fn require_ready(&self) -> Result<()> {
        let state = *self.state.read().await;
        match state {
            ConnectionState::Initialized => Ok(()),
            // Lazy reconnect applies only after a first generation. A caller
            // that observes another caller's repair in flight (Connecting or
            // Open) queues behind the reconnect mutex and re-checks, instead
            // of failing.
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Open
                if self.generation.load(Ordering::SeqCst) > 0 =>
            {
                Ok(())
            }
            ConnectionState::Closed => Err(anyhow::anyhow!(HomelinkError::IllegalState(
                "client is shut down".to_string()
            ))),
            _ => Err(anyhow::anyhow!(HomelinkError::IllegalState(format!(
                "not initialized (state {state:?}); call connect() first"
            )))),
        }
    }

    async fn is_alive(&self) -> bool {
        *self.state.read().await == ConnectionState::Initialized
    }

    /// Transition Open/Initialized to Disconnected. Never leaves Closed.
    async fn mark_dead(&self) {
        let mut state = self.state.write().await;
        if matches!(
            *state,
            ConnectionState::Open | ConnectionState::Initialized
        ) {
            *state = ConnectionState::Disconnected;
        }
    }

    // -----------------------------------------------------------------------
    // Connection establishment and teardown
    // -----------------------------------------------------------------------

    /// Open stream → await endpoint → initialize handshake.
    ///
    /// Caller must hold the reconnect mutex. On failure the client rolls
    /// back to `Closed` so concurrently blocked callers fail fast instead of
    /// piling up further handshakes.
    async fn establish(&self) -> Result<()> {
        match self.try_establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.teardown(FailureCause::ConnectionLost).await;
                *self.state.write().await = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    async fn try_establish(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let token = self.tokens.bearer_token().await?;
        let cancel = CancellationToken::new();
        let events = self
            .connection
            .open(&format!("Bearer {token}"), cancel.clone())
            .await?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let task = tokio::spawn(reader_loop(
            events,
            endpoint_tx,
            Arc::clone(&self.endpoint),
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
        ));
        {
            let mut reader = self.reader.lock().await;
            *reader = Some(ReaderHandle { cancel, task });
        }

        // The endpoint announcement is the very first inbound event.
        let path = tokio::time::timeout(self.config.request_timeout(), endpoint_rx)
            .await
            .map_err(|_| {
                anyhow::anyhow!(HomelinkError::Connection(
                    "timed out waiting for the session endpoint".to_string()
                ))
            })?
            .map_err(|_| {
                anyhow::anyhow!(HomelinkError::Connection(
                    "stream ended before the session endpoint arrived".to_string()
                ))
            })?;
        tracing::debug!(endpoint = %path, "session endpoint received");

        *self.state.write().await = ConnectionState::Open;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let params = serde_json::to_value(InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: self.config.client_name.clone(),
                version: self.config.client_version.clone(),
            },
        })?;
        let value = self
            .dispatcher
            .request(METHOD_INITIALIZE, Some(params), self.config.request_timeout())
            .await
            .map_err(|e| {
                anyhow::anyhow!(HomelinkError::Handshake(format!("initialize failed: {e}")))
            })?;

        let response: InitializeResponse = serde_json::from_value(value).map_err(|e| {
            anyhow::anyhow!(HomelinkError::Handshake(format!(
                "malformed initialize response: {e}"
            )))
        })?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(anyhow::anyhow!(HomelinkError::Handshake(format!(
                "unsupported protocol version {:?}",
                response.protocol_version
            ))));
        }

        // Strictly after the response is validated, never before.
        self.dispatcher.notify(METHOD_INITIALIZED, None).await?;

        tracing::info!(
            server = %response.server_info.name,
            server_version = %response.server_info.version,
            protocol = %response.protocol_version,
            "session initialized"
        );
        *self.server_info.write().await = Some(response);
        *self.state.write().await = ConnectionState::Initialized;

        Ok(())
    }

    /// Tear down the current generation: cancel the reader, fail pending
    /// entries with `cause`, clear the session endpoint.
    ///
    /// Caller must hold the reconnect mutex. The HTTP client and the
    /// transport connection object stay reusable.
    async fn teardown(&self, cause: FailureCause) {
        let reader = { self.reader.lock().await.take() };
        if let Some(handle) = reader {
            handle.cancel.cancel();
            handle.task.abort();
        }
        self.pending.fail_all(cause);
        *self.endpoint.write().await = None;
        *self.server_info.write().await = None;
    }

    /// Clear all per-generation state ahead of a reconnect.
    ///
    /// The id counter restarts only after `fail_all` drained the prior
    /// generation, so no id collision across generations is observable.
    async fn reset(&self) {
        self.teardown(FailureCause::ConnectionLost).await;
        self.next_id.store(1, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

// ---------------------------------------------------------------------------
// Stream reader task
// ---------------------------------------------------------------------------

/// Consume the inbound event sequence for one connection generation.
///
/// First event must be the endpoint announcement, forwarded through
/// `endpoint_tx` to the waiting `connect`. Every subsequent message is
/// matched against the pending table by id. On `Failed`/`Closed` the
/// connection is marked dead and all pending entries fail with
/// `ConnectionLost`; recovery is left to the next outbound send.
async fn reader_loop(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    endpoint_tx: oneshot::Sender<String>,
    endpoint: Arc<RwLock<Option<String>>>,
    pending: Arc<PendingRequests>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Endpoint(path) => match endpoint_tx.take() {
                Some(tx) => {
                    *endpoint.write().await = Some(path.clone());
                    let _ = tx.send(path);
                }
                None => {
                    tracing::warn!(%path, "duplicate endpoint announcement ignored");
                }
            },
            StreamEvent::Message(raw) => {
                handle_message(&raw, &pending);
            }
            StreamEvent::Failed(reason) => {
                tracing::warn!(%reason, "event stream failed");
                connection_died(&state, &pending).await;
                return;
            }
            StreamEvent::Closed => {
                tracing::debug!("event stream closed by the server");
                connection_died(&state, &pending).await;
                return;
            }
        }
    }
    // Channel dropped: the generation was cancelled locally; teardown has
    // already handled state and pending entries.
}

/// Mark the connection dead and fail every in-flight request.
async fn connection_died(
    state: &Arc<RwLock<ConnectionState>>,
    pending: &Arc<PendingRequests>,
) {
    {
        let mut state = state.write().await;
        if matches!(
            *state,
            ConnectionState::Open | ConnectionState::Initialized | ConnectionState::Connecting
        ) {
            *state = ConnectionState::Disconnected;
        }
    }
    pending.fail_all(FailureCause::ConnectionLost);
}

/// Classify one inbound message and dispatch it.
///
/// Responses resolve their pending entry. Anything else — server-initiated
/// requests, notifications, unclassifiable payloads — is logged and dropped.
fn handle_message(raw: &str, pending: &PendingRequests) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("failed to parse inbound message: {e}");
            return;
        }
    };

    let has_id = value.get("id").is_some_and(|v| !v.is_null());
    let has_method = value.get("method").is_some();
    let has_result = value.get("result").is_some();
    let has_error = value.get("error").is_some();

    if has_id && (has_result || has_error) && !has_method {
        let id_val = &value["id"];
        let id: u64 = if let Some(n) = id_val.as_u64() {
            n
        } else if let Some(n) = id_val.as_str().and_then(|s| s.parse::<u64>().ok()) {
            n
        } else {
            tracing::warn!("response has non-integer id: {id_val}");
            return;
        };

        let outcome = if let Some(error_val) = value.get("error") {
            let rpc_error = serde_json::from_value::<JsonRpcError>(error_val.clone())
                .unwrap_or_else(|_| JsonRpcError {
                    code: -32603,
                    message: format!("malformed error object: {error_val}"),
                    data: None,
                });
            Err(FailureCause::Rpc(rpc_error))
        } else {
            Ok(value
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null))
        };

        if !pending.complete(id, outcome) {
            tracing::debug!("response for unknown id {id} dropped");
        }
    } else if has_method {
        let method = value.get("method").and_then(|m| m.as_str()).unwrap_or("?");
        tracing::debug!(method, "dropping server-initiated message");
    } else {
        tracing::debug!(
            "unclassifiable inbound message ignored \
             (has_id={has_id} has_method={has_method} has_result={has_result} has_error={has_error})"
        );
    }
}
