//! Request correlator: pairs outbound calls with their responses.
//!
//! Every awaited call registers a oneshot sender under a fresh correlation
//! id. The response path and the timeout path both try to remove that
//! entry; whichever removes it decides the outcome, so a call resolves or
//! rejects exactly once.

use busrpc_types::{RpcError, RpcResult};
use busrpc_wire::ResponseEnvelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// In-flight calls of one process.
pub struct RequestCorrelator {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>,
    next_seq: AtomicU64,
    /// Random per-instance suffix so ids differ across restarts of a pid.
    tag: String,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self {
            pending: Arc::default(),
            next_seq: AtomicU64::new(0),
            tag: tag[..8].to_string(),
        }
    }

    /// A correlation id never issued before by this instance.
    ///
    /// Ids never contain `:` (the separator of the wire call id).
    pub fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{seq:x}-{}", self.tag)
    }

    /// Register a pending request. The returned guard removes the entry if
    /// the caller stops waiting before an outcome is reached.
    pub fn register(&self, id: &str) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(id.to_string(), tx);
        PendingRequest {
            pending: Arc::clone(&self.pending),
            id: id.to_string(),
            rx,
        }
    }

    /// Hand a response to its waiting caller.
    ///
    /// Returns `false` when no request is pending under that id (it already
    /// timed out, or was never issued here); such responses are ignored.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let waiter = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&response.request_id)
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => {
                debug!(request_id = %response.request_id, "ignoring late or unknown response");
                false
            }
        }
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered call waiting for its response.
pub struct PendingRequest {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>,
    id: String,
    rx: oneshot::Receiver<ResponseEnvelope>,
}

impl PendingRequest {
    /// The correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, failing with `timeout_error` if none arrives
    /// within `timeout`.
    pub async fn wait(mut self, timeout: Duration, timeout_error: RpcError) -> RpcResult<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => into_result(response),
            Ok(Err(_)) => Err(timeout_error),
            Err(_elapsed) => {
                if self.remove() {
                    return Err(timeout_error);
                }
                // The response won the race and is already in the channel.
                match (&mut self.rx).await {
                    Ok(response) => into_result(response),
                    Err(_) => Err(timeout_error),
                }
            }
        }
    }

    fn remove(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&self.id).is_some()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.remove();
    }
}

fn into_result(response: ResponseEnvelope) -> RpcResult<Value> {
    match response.error {
        Some(error) => Err(RpcError::Remote(error)),
        None => Ok(response.data.unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn timeout_error() -> RpcError {
        RpcError::Timeout {
            pid: "p1".to_string(),
            method: "wait".to_string(),
        }
    }

    #[test]
    fn test_ids_are_unique_and_colon_free() {
        let correlator = RequestCorrelator::new();
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| correlator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| !id.contains(':')));
    }

    #[test]
    fn test_ids_differ_between_instances() {
        let a = RequestCorrelator::new();
        let b = RequestCorrelator::new();
        assert_ne!(a.next_id(), b.next_id());
    }

    #[tokio::test]
    async fn test_resolve_with_data() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let pending = correlator.register(&id);
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve(ResponseEnvelope::ok(&id, json!(51))));
        let result = pending.wait(Duration::from_secs(1), timeout_error()).await;
        assert_eq!(result, Ok(json!(51)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_with_error() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let pending = correlator.register(&id);

        correlator.resolve(ResponseEnvelope::err(&id, "test".to_string()));
        let result = pending.wait(Duration::from_secs(1), timeout_error()).await;
        assert_eq!(result, Err(RpcError::Remote("test".to_string())));
    }

    #[tokio::test]
    async fn test_missing_data_resolves_null() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let pending = correlator.register(&id);

        correlator.resolve(ResponseEnvelope {
            request_id: id.clone(),
            error: None,
            data: None,
        });
        let result = pending.wait(Duration::from_secs(1), timeout_error()).await;
        assert_eq!(result, Ok(Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_and_ignores_late_response() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let pending = correlator.register(&id);

        let result = pending.wait(Duration::from_millis(50), timeout_error()).await;
        assert_eq!(result, Err(timeout_error()));
        assert_eq!(correlator.pending_count(), 0);

        assert!(!correlator.resolve(ResponseEnvelope::ok(&id, json!(1))));
    }

    #[tokio::test]
    async fn test_dropped_request_is_unregistered() {
        let correlator = RequestCorrelator::new();
        let id = correlator.next_id();
        let pending = correlator.register(&id);
        assert_eq!(pending.id(), id);
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
    }
}
