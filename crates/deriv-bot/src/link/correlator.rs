//! Request/response correlation over the duplexed socket.
//!
//! Every outbound payload is tagged with a monotonically increasing
//! `req_id`; a map of pending resolvers pairs the first matching inbound
//! frame with its caller. Frames that claim no pending slot fall through
//! to stream dispatch in the link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// Transport-level failures of a correlated call. Application-level broker
/// errors resolve successfully with the error body on the frame; the
/// caller decides.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("Not connected")]
    NotConnected,

    #[error("Call timed out")]
    Timeout,

    #[error("Link lost before a response arrived")]
    LinkLost,

    #[error("Payload serialization failed: {0}")]
    Serialize(String),
}

type Resolver = oneshot::Sender<Value>;

/// Pending-call table keyed by `req_id`.
///
/// Each call lives from `register` to the first `resolve` with its id, to
/// `abandon` on timeout, or to `fail_all` on reconnect.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, Resolver>>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh `req_id` and register its resolver.
    pub fn register(&self) -> (u64, oneshot::Receiver<Value>) {
        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(req_id, tx);
        (req_id, rx)
    }

    /// Allocate a `req_id` without a resolver, for fire-and-forget sends
    /// (subscriptions, pings). Any response is handled as a stream frame.
    pub fn next_req_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolve the pending call for `req_id` with the full frame. Returns
    /// false when no call is pending under that id, in which case the
    /// frame belongs to a stream.
    pub fn resolve(&self, req_id: u64, frame: Value) -> bool {
        let resolver = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&req_id);
        match resolver {
            Some(tx) => {
                // The caller may have timed out and dropped the receiver.
                let _ = tx.send(frame);
                true
            }
            None => false,
        }
    }

    /// Drop the pending slot for `req_id` (caller gave up).
    pub fn abandon(&self, req_id: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&req_id);
    }

    /// Fail every outstanding call by dropping its resolver. Callers
    /// observe `LinkLost`. Used when the socket drops.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let orphaned = pending.len();
        if orphaned > 0 {
            warn!(orphaned, "Dropping pending calls after link loss");
        }
        pending.clear();
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}
