//! Client configuration types
//!
//! [`ClientConfig`] holds everything needed to reach the automation backend:
//! the base URL, the fixed path of the inbound event stream, and the two
//! request deadlines (metadata calls vs. tool execution). The struct derives
//! serde so the surrounding application can embed it in its own
//! configuration file; loading that file is the application's job.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default path of the inbound SSE event stream under the base URL.
pub const DEFAULT_SSE_PATH: &str = "/mcp_server/sse";

/// Default deadline for metadata requests (`initialize`, `tools/list`, `ping`).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default deadline for `tools/call`. Tool execution is slower than metadata
/// calls, so it gets an extended budget.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Default TCP/TLS connect timeout for outbound calls.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration for one protocol-client instance.
///
/// # Examples
///
/// ```
/// use homelink::config::ClientConfig;
///
/// let cfg = ClientConfig::new(url::Url::parse("http://homelink.local:8123").unwrap());
/// assert_eq!(cfg.sse_path, "/mcp_server/sse");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the automation backend.
    pub base_url: url::Url,

    /// Path of the inbound event stream, resolved against `base_url`.
    #[serde(default = "default_sse_path")]
    pub sse_path: String,

    /// Deadline in seconds for metadata requests.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Deadline in seconds for tool execution requests.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Client name reported in the `initialize` handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Client version reported in the `initialize` handshake.
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_sse_path() -> String {
    DEFAULT_SSE_PATH.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_tool_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the base URL.
    pub fn new(base_url: url::Url) -> Self {
        Self {
            base_url,
            sse_path: default_sse_path(),
            request_timeout_secs: default_request_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }

    /// Metadata request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Tool execution deadline as a [`Duration`].
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
