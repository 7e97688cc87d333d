//! Bearer-token provider seam
//!
//! The client never caches tokens: every outbound call asks the
//! [`TokenProvider`] for a fresh bearer token. This is deliberate — a 401
//! must be recoverable by fetching a new token on the next handshake rather
//! than failing permanently. The provider is expected to refresh internally
//! as needed; this crate treats it as opaque.

use std::fmt;

use crate::error::Result;

/// Supplies valid bearer tokens for outbound calls.
///
/// Implemented by the application's auth layer (which owns the OAuth refresh
/// machinery). [`StaticTokenProvider`] covers long-lived access tokens and
/// tests.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    /// Return a currently valid bearer token, refreshing first if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error when no valid token can be produced (e.g. the
    /// refresh token itself was revoked).
    async fn bearer_token(&self) -> Result<String>;
}

/// A [`TokenProvider`] that always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a fixed token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log token material.
        f.debug_struct("StaticTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
