//! Client construction config: transport mode, endpoint URLs, and the
//! knobs that `call`/`void` read their defaults from.

use std::time::Duration;

/// Which wire transport a call (or the client's persistent connection)
/// uses. Switchable at runtime via [`crate::Client::set_transport_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Every call is a one-shot HTTP POST; no persistent connection.
    HttpOnly,
    /// Calls are HTTP POSTs, but events arrive over a standing SSE stream.
    HttpSse,
    /// A single WebSocket carries calls, results, and events.
    WebSocket,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP(S) URL, e.g. `http://localhost:8080`. Used for HTTP POST
    /// and SSE (at `{http_base}/__h`).
    pub http_base: String,
    /// WebSocket URL, e.g. `ws://localhost:8080/helene-ws`.
    pub ws_url: String,
    pub transport: TransportMode,
    /// This client's stable identity, sent as SETUP's `uuid` and as the
    /// `x-client-id` header on HTTP/SSE requests.
    pub client_uuid: String,
    /// Default per-call timeout when the caller does not override it.
    pub default_call_timeout: Duration,
    /// Idle window after which, if configured, an inactive client closes
    /// its transport. `None` disables the idle timeout entirely.
    pub idle_timeout: Option<Duration>,
    /// Expected cadence of server-initiated `HEARTBEAT` frames over the
    /// WebSocket transport. The reconnect loop treats a full interval of
    /// silence since the last heartbeat as a dead connection and forces a
    /// reconnect. Must match the server's own `keep_alive_interval`.
    pub keep_alive_interval: Duration,
}

/// Generates a fresh client identity, for callers with no persisted one.
pub fn new_client_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ClientConfig {
    pub fn new(http_base: impl Into<String>, ws_url: impl Into<String>, client_uuid: impl Into<String>) -> Self {
        Self {
            http_base: http_base.into(),
            ws_url: ws_url.into(),
            transport: TransportMode::WebSocket,
            client_uuid: client_uuid.into(),
            default_call_timeout: Duration::from_secs(10),
            idle_timeout: None,
            keep_alive_interval: Duration::from_secs(10),
        }
    }

    pub fn http_endpoint(&self) -> String {
        format!("{}/__h", self.http_base)
    }
}
