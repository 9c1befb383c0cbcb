//! Shared application state, mirroring the teacher's `AppState` pattern: one
//! struct, cheaply cloneable, handed to every axum handler via `State`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use realtime_core::{Dispatcher, DispatcherConfig, RateLimitConfig};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::relay::RedisRelay;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Unique per server process; tags outgoing cluster-bus publishes so a
    /// relay receive loop can drop its own echo.
    pub instance_id: String,
    pub keep_alive_interval: std::time::Duration,
    /// Present once a cluster relay connects; `/__h/presence` queries it
    /// for cluster-wide counts instead of this instance's own.
    pub presence_relay: Arc<RwLock<Option<Arc<RedisRelay>>>>,
    /// Per-caller rate limiters for anonymous (no `x-client-id`) HTTP POST
    /// calls, keyed by remote address so repeated calls from the same
    /// caller share one limiter instead of each getting a fresh one.
    pub anonymous_rate_limiters: Arc<RwLock<std::collections::HashMap<String, Arc<realtime_core::RateLimiter>>>>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> AppState {
        let dispatcher_config = DispatcherConfig {
            rate_limit: RateLimitConfig {
                max_requests: config.rate_limit_max,
                interval: config.rate_limit_interval,
            },
            allowed_context_keys: config.allowed_context_keys.clone(),
            accept_connections: Arc::new(AtomicBool::new(true)),
        };
        AppState {
            dispatcher: Dispatcher::new(dispatcher_config).await,
            instance_id: Uuid::new_v4().simple().to_string(),
            keep_alive_interval: config.keep_alive_interval,
            presence_relay: Arc::new(RwLock::new(None)),
            anonymous_rate_limiters: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }
}
