//! Correlation of locally originated requests with their responses.
//!
//! Each outgoing request gets a fresh id and a oneshot waiter in the pending
//! table. Exactly one of three events removes the entry: the matching
//! response, the request's timeout, or the router stopping. Whichever comes
//! first wins; the other two find nothing to remove and do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use linerpc_core::{JsonRpcResponse, JsonRpcResponsePayload, RequestId, RpcError, RpcResult};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Waiter = oneshot::Sender<RpcResult<Value>>;

/// Receiving end handed to the caller of `send_request`.
pub(crate) type ResponseReceiver = oneshot::Receiver<RpcResult<Value>>;

#[derive(Debug)]
struct Pending {
    method: String,
    waiter: Waiter,
}

/// Pending table for outgoing requests.
#[derive(Debug)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<RequestId, Pending>>,
    next_id: AtomicU64,
    max_pending: usize,
}

impl Correlator {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_pending,
        }
    }

    /// Reserve a fresh id for `method`.
    ///
    /// Ids come from a per-router counter rendered as strings, so they cannot
    /// collide with integer ids chosen by the peer.
    pub(crate) fn register(&self, method: &str) -> RpcResult<(RequestId, ResponseReceiver)> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return Err(RpcError::overloaded(self.max_pending));
        }

        let id = RequestId::String(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
        let (waiter, receiver) = oneshot::channel();
        pending.insert(
            id.clone(),
            Pending {
                method: method.to_string(),
                waiter,
            },
        );
        trace!(%id, method, "Registered pending request");
        Ok((id, receiver))
    }

    /// Complete the correlation named by `response.id`.
    ///
    /// Returns `false` when no such correlation is live.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(entry) = self.pending.lock().remove(&response.id) else {
            return false;
        };

        let outcome = match response.payload {
            JsonRpcResponsePayload::Success { result } => Ok(result),
            JsonRpcResponsePayload::Error { error } => Err(RpcError::from(error)),
        };
        debug!(id = %response.id, method = %entry.method, ok = outcome.is_ok(), "Resolved pending request");
        // The caller may have stopped waiting; nothing left to do then.
        let _ = entry.waiter.send(outcome);
        true
    }

    /// Drop the correlation for `id` without completing it.
    pub(crate) fn forget(&self, id: &RequestId) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Reject every live correlation with `error`, emptying the table.
    pub(crate) fn reject_all(&self, error: &RpcError) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.waiter.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for the outcome of request `id`, giving up after `timeout`.
    ///
    /// If the caller's future is dropped early the correlation is forgotten.
    pub(crate) async fn wait(
        &self,
        id: RequestId,
        method: &str,
        mut receiver: ResponseReceiver,
        timeout: Duration,
    ) -> RpcResult<Value> {
        let _guard = ForgetOnDrop {
            correlator: self,
            id: &id,
        };

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::internal("Response channel closed")),
            Err(_) => {
                if self.forget(&id) {
                    debug!(%id, method, ?timeout, "Pending request timed out");
                    Err(RpcError::timeout(method, timeout))
                } else {
                    // A response or a stop removed the entry first; its outcome is in flight.
                    receiver
                        .await
                        .unwrap_or_else(|_| Err(RpcError::internal("Response channel closed")))
                }
            }
        }
    }
}

struct ForgetOnDrop<'a> {
    correlator: &'a Correlator,
    id: &'a RequestId,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}
