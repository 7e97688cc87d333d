//! Homelink - tool-protocol client for home-automation backends
//!
//! This library implements the client side of a JSON-RPC 2.0 tool protocol
//! over a hybrid HTTP transport: a long-lived Server-Sent Events stream for
//! inbound messages and per-message HTTP POSTs for outbound traffic. It is
//! built for voice-assistant frontends that expose smart-home tools to a
//! speech session and need the connection to survive short-lived bearer
//! tokens.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `client`: Connection state machine, reconnection coordinator, public API
//! - `dispatch`: Outbound request dispatcher and response correlation
//! - `transport`: SSE stream handling and event parsing
//! - `pending`: In-flight request table with exactly-once fulfillment
//! - `auth`: Bearer token provider abstraction
//! - `config`: Client configuration and timeouts
//! - `types`: Wire types for the JSON-RPC protocol
//! - `error`: Error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use homelink::{ClientConfig, McpClient, StaticTokenProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new(url::Url::parse("http://homelink.local:8123")?);
//!     let client = McpClient::new(config, Arc::new(StaticTokenProvider::new("token")))?;
//!
//!     client.connect().await?;
//!     for tool in client.list_tools().await? {
//!         println!("{}", tool.name);
//!     }
//!     let result = client.call_tool("turn_on_light", None).await?;
//!     if result.is_error() {
//!         eprintln!("tool failed: {:?}", result.text());
//!     }
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use auth::{StaticTokenProvider, TokenProvider};
pub use client::{ConnectionState, McpClient};
pub use config::ClientConfig;
pub use error::{HomelinkError, Result};
pub use types::{Tool, ToolCallResult, ToolContent};
