//! Error types for the homelink tool-protocol client
//!
//! This module defines the error taxonomy used throughout the crate, using
//! `thiserror` for ergonomic error handling. Callers receive errors through
//! the [`Result`] alias (an `anyhow::Result`), and can downcast to
//! [`HomelinkError`] when the specific kind matters.

use thiserror::Error;

/// Main error type for homelink operations
///
/// Covers every failure mode of the connection lifecycle: stream
/// establishment, the initialize handshake, authentication, request
/// timeouts, JSON-RPC level failures, and loss of the connection while a
/// request is in flight.
#[derive(Error, Debug)]
pub enum HomelinkError {
    /// The inbound event stream could not be opened, or the session endpoint
    /// never arrived.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the `initialize` request or returned a malformed
    /// or unsupported handshake response.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The backend returned HTTP 401. Consumed internally by the
    /// reconnection path; callers only see this if the post-reconnect retry
    /// is rejected as well.
    #[error("unauthorized: backend rejected the bearer token")]
    Unauthorized,

    /// No response arrived within the request deadline.
    #[error("request timed out: method={method}")]
    Timeout {
        /// The JSON-RPC method that timed out.
        method: String,
    },

    /// The server returned a JSON-RPC error object or an unexpected HTTP
    /// status.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport died while a request was pending.
    #[error("connection lost while request was pending")]
    ConnectionLost,

    /// The client was shut down while a request was pending, or an operation
    /// was attempted after shutdown.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation was invoked in a state that does not permit it (e.g.
    /// `list_tools` before `connect`).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HomelinkError {
    /// True when `err`'s underlying cause is [`HomelinkError::Unauthorized`].
    ///
    /// Used by the reconnection coordinator to distinguish auth expiry from
    /// failures that must surface to the caller.
    pub fn is_unauthorized(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<HomelinkError>(),
            Some(HomelinkError::Unauthorized)
        )
    }
}

/// Result type alias for homelink operations
///
/// Uses `anyhow::Error` as the error type so that every failure surfaces to
/// the calling layer as a single type carrying a message and optional cause.
pub type Result<T> = anyhow::Result<T>;
