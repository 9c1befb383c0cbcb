//! The request-in-flight map: `id -> {method, resolver, deadline}`. Populated
//! when a call is routed over the WebSocket (HTTP calls resolve directly from
//! the response and never enter this map); drained by `RESULT`/`ERROR` frames
//! or by timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use wire_protocol::RequestId;

use crate::ClientError;

pub struct PendingCall {
    pub method: String,
    resolver: oneshot::Sender<Result<Value, ClientError>>,
}

#[derive(Default)]
pub struct InFlightMap {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
}

impl InFlightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId, method: String) -> oneshot::Receiver<Result<Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, PendingCall { method, resolver: tx });
        rx
    }

    /// Completes a pending call with a `RESULT`/`ERROR` outcome. No-op if the
    /// id is unknown (already timed out, or never registered).
    pub fn complete(&self, id: RequestId, outcome: Result<Value, ClientError>) {
        if let Some(entry) = self.pending.lock().unwrap().remove(&id) {
            let _ = entry.resolver.send(outcome);
        }
    }

    /// Removes an id without resolving anything — used when a local timeout
    /// fires before any server response arrives. Returns the call's method
    /// name for diagnostics.
    pub fn forget(&self, id: &RequestId) -> Option<String> {
        self.pending.lock().unwrap().remove(id).map(|entry| entry.method)
    }

    /// Fails every outstanding call, used when the transport drops: entries
    /// in flight over WebSocket do not survive a reconnect.
    pub fn fail_all(&self, error: ClientError) {
        let mut pending = self.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            let _ = entry.resolver.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_resolves_the_matching_receiver() {
        let map = InFlightMap::new();
        let id = RequestId::new();
        let rx = map.register(id, "echo".into());
        map.complete(id, Ok(json!("hi")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("hi"));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn complete_on_unknown_id_is_a_no_op() {
        let map = InFlightMap::new();
        map.complete(RequestId::new(), Ok(json!(null)));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_call() {
        let map = InFlightMap::new();
        let rx1 = map.register(RequestId::new(), "a".into());
        let rx2 = map.register(RequestId::new(), "b".into());
        map.fail_all(ClientError::Disconnected);
        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Disconnected)));
    }
}
