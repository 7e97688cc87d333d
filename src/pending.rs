//! Pending-request table
//!
//! Correlates an outbound request's id with the caller awaiting its
//! response. Each entry is a [`oneshot::Sender`] that is consumed exactly
//! once: either by a matching response from the stream reader, or by
//! `fail_all` when the connection dies or the client shuts down. Callers
//! that stop waiting (timeout or future cancellation) must actively remove
//! their entry — a leaked entry is a correctness bug, because a later
//! orphaned response must find no id to attach to.
//!
//! The map is guarded by a `std::sync::Mutex` rather than an async one:
//! nothing awaits while holding the lock, and a synchronous lock lets the
//! RAII [`PendingGuard`] unregister from `Drop` when a caller's future is
//! cancelled mid-await.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::types::JsonRpcError;

/// The reason a pending request failed without a server result.
#[derive(Debug, Clone)]
pub enum FailureCause {
    /// The server answered with a JSON-RPC error object.
    Rpc(JsonRpcError),
    /// The transport died while the request was in flight.
    ConnectionLost,
    /// The client was shut down while the request was in flight.
    ConnectionClosed,
}

/// What a registered caller eventually receives.
pub type Outcome = std::result::Result<serde_json::Value, FailureCause>;

/// Table of in-flight requests keyed by id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<Outcome>>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver the caller awaits on.
    ///
    /// Must be called before the corresponding send, so a response racing
    /// ahead of registration is impossible.
    pub fn register(&self, id: u64) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        debug_assert!(!inner.contains_key(&id), "request id {id} already pending");
        inner.insert(id, tx);
        rx
    }

    /// Fulfill the entry for `id`, removing it.
    ///
    /// Returns `false` when no entry exists — late responses for ids that
    /// already timed out or were removed are dropped this way.
    pub fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let tx = {
            let mut inner = self.inner.lock().expect("pending table lock poisoned");
            inner.remove(&id)
        };
        match tx {
            Some(tx) => {
                // The caller may have stopped waiting between removal and
                // send; a failed send is not an error.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without fulfilling it.
    ///
    /// Used on timeout, send failure, and caller cancellation. Returns
    /// `false` when the entry was already gone.
    pub fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().expect("pending table lock poisoned");
        inner.remove(&id).is_some()
    }

    /// Fail every pending entry with `cause` and empty the table.
    pub fn fail_all(&self, cause: FailureCause) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().expect("pending table lock poisoned");
            inner.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(cause.clone()));
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table lock poisoned").len()
    }

    /// Whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard that unregisters a pending entry on drop.
///
/// Armed on registration; disarmed once the entry has been consumed through
/// `complete`/`fail_all`. Dropping an armed guard (timeout, caller
/// cancellation) removes the entry so a late response cannot match it.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    table: &'a PendingRequests,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    /// Guard the entry for `id` in `table`.
    pub fn new(table: &'a PendingRequests, id: u64) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    /// Disarm after the entry was consumed by the completing side.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.remove(self.id);
        }
    }
}
