//! Pluggable cluster fan-out. `realtime-core` only knows the trait; a
//! concrete bus (e.g. Redis pub/sub) lives with the transport that wires it
//! up, since instance-id tagging and own-echo suppression are bus-specific.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ClusterBus: Send + Sync {
    async fn publish(&self, channel: &str, event: &str, params: Option<Value>);
}
