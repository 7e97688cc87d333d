//! Inbound SSE event stream for the hybrid transport
//!
//! The transport is split: the server pushes messages over one long-lived
//! SSE stream opened with a GET to a fixed path, while the client sends its
//! own messages as individual HTTP POSTs (see [`crate::dispatch`]). This
//! module owns the inbound half.
//!
//! [`SseConnection::open`] suspends until the stream is acknowledged open,
//! then spawns one reader task that parses the SSE byte stream and emits a
//! tagged [`StreamEvent`] sequence to its owner: the session endpoint
//! announcement (first event, exactly once per connection generation), raw
//! messages, and failure/closure. The connection object itself never
//! attempts recovery — that policy lives in the client, not the transport.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{HomelinkError, Result};

/// SSE event name carrying the session endpoint path as its payload.
const ENDPOINT_EVENT: &str = "endpoint";

/// One inbound event from the stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The server announced the session-specific POST path.
    Endpoint(String),
    /// A raw JSON-RPC message payload.
    Message(String),
    /// The stream failed mid-flight.
    Failed(String),
    /// The stream ended in an orderly fashion.
    Closed,
}

/// Owns the long-lived inbound event stream.
///
/// Reusable across connection generations: every call to [`open`] starts a
/// fresh stream with a fresh event channel.
///
/// [`open`]: SseConnection::open
#[derive(Debug)]
pub struct SseConnection {
    http: Arc<reqwest::Client>,
    stream_url: url::Url,
}

impl SseConnection {
    /// Create a connection targeting `stream_url`. No I/O happens here.
    pub fn new(http: Arc<reqwest::Client>, stream_url: url::Url) -> Self {
        Self { http, stream_url }
    }

    /// Open the event stream and return the receiver of its events.
    ///
    /// Suspends until the GET is acknowledged with a success status, then
    /// spawns the reader task. Cancelling `cancel` stops the reader without
    /// emitting further events.
    ///
    /// # Errors
    ///
    /// Returns [`HomelinkError::Connection`] on any failure to open,
    /// including an auth rejection: a dead-or-unauthorized stream is a
    /// connection problem, and auth recovery is driven from the outbound
    /// path, not from here.
    pub async fn open(
        &self,
        auth_header: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>> {
        let response = self
            .http
            .get(self.stream_url.as_str())
            .header("Accept", "text/event-stream")
            .header("Authorization", auth_header)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(HomelinkError::Connection(format!(
                    "event stream request failed: {e}"
                )))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!(HomelinkError::Connection(format!(
                "event stream returned HTTP {status}"
            ))));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("event stream reader cancelled");
                }
                _ = read_sse_stream(byte_stream, event_tx) => {}
            }
        });

        Ok(event_rx)
    }
}

/// Parse an SSE byte stream and forward complete events to `event_tx`.
///
/// Consumes the stream until it ends or errors. SSE field processing:
///
/// - `event: endpoint` — forwarded as [`StreamEvent::Endpoint`].
/// - `event: ping` / `data: [PING]` (case-insensitive) — silently discarded.
/// - any other `data:` value — forwarded as [`StreamEvent::Message`].
/// - `id:` / `retry:` — parsed and ignored; the session endpoint is
///   generation-scoped, so stream resumption has no meaning here.
async fn read_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
) {
    use futures::StreamExt;

    // Buffer accumulates raw bytes between `\n\n` boundaries.
    let mut buffer = String::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                let _ = event_tx.send(StreamEvent::Failed(e.to_string()));
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(s) => s,
            Err(_) => continue,
        };

        buffer.push_str(text);

        // SSE events are separated by blank lines (`\n\n`).
        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            forward_sse_event(&event_block, &event_tx);
        }
    }

    // Process any remaining partial event in the buffer.
    if !buffer.is_empty() {
        forward_sse_event(&buffer, &event_tx);
    }

    let _ = event_tx.send(StreamEvent::Closed);
}

/// Classify a single SSE event block (the text between two `\n\n` delimiters)
/// and forward it.
fn forward_sse_event(event_block: &str, event_tx: &mpsc::UnboundedSender<StreamEvent>) {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
        // `id:` and `retry:` fields and `:` comments are ignored.
    }

    // Ping events are keepalive noise.
    if let Some(et) = event_type {
        if et.eq_ignore_ascii_case("ping") {
            return;
        }
    }

    let data = data_lines.join("\n");
    if data.eq_ignore_ascii_case("[ping]") || data.is_empty() {
        return;
    }

    let event = match event_type {
        Some(ENDPOINT_EVENT) => StreamEvent::Endpoint(data),
        _ => StreamEvent::Message(data),
    };
    let _ = event_tx.send(event);
}
