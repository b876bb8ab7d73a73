//! Request/reply correlation
//!
//! Every outbound call that expects a reply gets one pending entry keyed by
//! its correlation id. An entry completes exactly once: by a matching reply,
//! by its own timeout, or by a disconnect sweep.

use civ_bridge_core::{BridgeError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiving end of a pending call
pub type PendingReply = oneshot::Receiver<Result<Value>>;

struct PendingRequest {
    created_at: Instant,
    completion: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

/// Table of in-flight requests
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry that fails with `CallTimeout` after `timeout`
    pub fn register(self: &Arc<Self>, id: String, timeout: Duration) -> Result<PendingReply> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(BridgeError::InvalidArguments(format!(
                "request id already in flight: {}",
                id
            )));
        }

        let (completion, reply) = oneshot::channel();
        let timer = tokio::spawn(expire(Arc::downgrade(self), id.clone(), timeout));
        pending.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                completion,
                timer,
            },
        );
        Ok(reply)
    }

    /// Complete the entry for `id`. Returns false when no such entry exists.
    pub fn complete(&self, id: &str, result: Result<Value>) -> bool {
        let entry = self.pending.lock().remove(id);
        let Some(entry) = entry else {
            debug!("Dropping reply for unknown request {}", id);
            return false;
        };
        entry.timer.abort();
        debug!(
            "Request {} completed after {:?}",
            id,
            entry.created_at.elapsed()
        );
        // Caller may have stopped waiting
        let _ = entry.completion.send(result);
        true
    }

    /// Drop the entry for `id` without completing it
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.lock().remove(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Complete every pending entry with `error`; returns how many there were
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.completion.send(Err(error.clone()));
        }
        if count > 0 {
            warn!("Failed {} pending request(s): {}", count, error);
        }
        count
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

async fn expire(correlator: Weak<Correlator>, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(correlator) = correlator.upgrade() {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if correlator.complete(&id, Err(BridgeError::CallTimeout(millis))) {
            warn!("Request {} timed out after {} ms", id, millis);
        }
    }
}
