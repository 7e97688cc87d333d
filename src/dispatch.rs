//! Outbound request dispatcher
//!
//! Serializes a request or notification, attaches a fresh bearer token, and
//! issues it as an HTTP POST against the current session endpoint. For
//! requests, the caller is then suspended on its pending-table entry until
//! the matching response arrives on the inbound stream, the deadline
//! expires, or the connection dies.
//!
//! The token is fetched from the [`TokenProvider`] on every call and never
//! cached here: a cached stale token would defeat the reconnect-on-401
//! design.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::auth::TokenProvider;
use crate::error::{HomelinkError, Result};
use crate::pending::{FailureCause, PendingGuard, PendingRequests};
use crate::types::{JsonRpcNotification, JsonRpcRequest};

/// Sends outbound JSON-RPC messages and classifies their outcome.
#[derive(Debug)]
pub struct Dispatcher {
    http: Arc<reqwest::Client>,
    base_url: url::Url,
    /// Session-specific POST path, valid only while a generation is open.
    endpoint: Arc<RwLock<Option<String>>>,
    pending: Arc<PendingRequests>,
    /// Per-generation id counter; reset by the client after `fail_all`.
    next_id: Arc<AtomicU64>,
    tokens: Arc<dyn TokenProvider>,
    /// Deadline for the POST itself (the ack, not the streamed response).
    post_timeout: Duration,
}

impl Dispatcher {
    /// Wire a dispatcher to the shared connection state.
    pub fn new(
        http: Arc<reqwest::Client>,
        base_url: url::Url,
        endpoint: Arc<RwLock<Option<String>>>,
        pending: Arc<PendingRequests>,
        next_id: Arc<AtomicU64>,
        tokens: Arc<dyn TokenProvider>,
        post_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            endpoint,
            pending,
            next_id,
            tokens,
            post_timeout,
        }
    }

    /// Send a request and suspend until its response, with `timeout`.
    ///
    /// Registers the fresh id in the pending table before the POST so the
    /// response can never race ahead of registration. The entry is removed
    /// on every exit path: response, timeout, send failure, and caller
    /// cancellation (via the pending guard's `Drop`).
    ///
    /// # Errors
    ///
    /// Returns [`HomelinkError::Unauthorized`] on HTTP 401,
    /// [`HomelinkError::Timeout`] when no response arrives within `timeout`,
    /// [`HomelinkError::Protocol`] for JSON-RPC error responses and
    /// unexpected statuses, and the connection-death errors when the stream
    /// dies mid-flight.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.pending.register(id);
        let mut guard = PendingGuard::new(&self.pending, id);

        let body = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params,
        })?;

        // Guard drop unregisters if the POST fails.
        self.post(body).await?;

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(res) => res,
            Err(_) => {
                // Remove before raising so a late response is dropped, not
                // misdelivered.
                guard.disarm();
                self.pending.remove(id);
                return Err(anyhow::anyhow!(HomelinkError::Timeout {
                    method: method.to_string(),
                }));
            }
        };

        // The completing side consumed the entry.
        guard.disarm();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(FailureCause::Rpc(e))) => {
                Err(anyhow::anyhow!(HomelinkError::Protocol(e.to_string())))
            }
            Ok(Err(FailureCause::ConnectionLost)) => {
                Err(anyhow::anyhow!(HomelinkError::ConnectionLost))
            }
            Ok(Err(FailureCause::ConnectionClosed)) => {
                Err(anyhow::anyhow!(HomelinkError::ConnectionClosed))
            }
            // Sender dropped without a value: the table was torn down.
            Err(_) => Err(anyhow::anyhow!(HomelinkError::ConnectionLost)),
        }
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let body = serde_json::to_string(&JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        })?;
        self.post(body).await
    }

    /// POST one serialized message to the session endpoint.
    ///
    /// Outcome classification: 401 → `Unauthorized`, other non-2xx →
    /// `Protocol`, request-level failure → `Connection`. Any response body is
    /// ignored — real responses arrive on the inbound stream.
    async fn post(&self, body: String) -> Result<()> {
        let path = {
            let endpoint = self.endpoint.read().await;
            endpoint.clone()
        }
        .ok_or_else(|| {
            anyhow::anyhow!(HomelinkError::IllegalState(
                "no session endpoint: connection is not open".to_string()
            ))
        })?;

        let url = self.base_url.join(&path).map_err(|e| {
            anyhow::anyhow!(HomelinkError::Connection(format!(
                "invalid session endpoint {path:?}: {e}"
            )))
        })?;

        let token = self.tokens.bearer_token().await?;

        let response = self
            .http
            .post(url)
            .timeout(self.post_timeout)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {token}"))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(HomelinkError::Connection(format!("HTTP POST failed: {e}")))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(anyhow::anyhow!(HomelinkError::Unauthorized));
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!(HomelinkError::Protocol(format!(
                "outbound call returned HTTP {status}"
            ))));
        }

        Ok(())
    }
}
