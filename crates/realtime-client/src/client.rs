//! The public client: transport selection, `call`/`void`, subscription
//! management, and the activity/idle-timeout hook.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tracing::warn;
use wire_protocol::{Frame, RequestId};

use crate::backoff::reconnect_delay;
use crate::config::{ClientConfig, TransportMode};
use crate::context_store::ContextStore;
use crate::errors::ClientError;
use crate::http::post_method;
use crate::inflight::InFlightMap;
use crate::subscriptions::{PendingBatch, SubscriptionBook};
use crate::ws_loop;

/// Options accepted by [`Client::call`]. All fields default to the
/// client-wide defaults when omitted via [`CallOptions::default`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub http: bool,
    pub http_fallback: bool,
    pub max_retries: u32,
    pub delay_between_retries: Duration,
    pub ignore_init: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            http: false,
            http_fallback: true,
            max_retries: 0,
            delay_between_retries: Duration::from_millis(0),
            ignore_init: false,
        }
    }
}

pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub http: reqwest::Client,
    pub inflight: InFlightMap,
    pub subscriptions: SubscriptionBook,
    pending: PendingBatch,
    flush_armed: AtomicBool,
    pub(crate) ws_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pub token: StdMutex<Option<String>>,
    pub context_store: Box<dyn ContextStore>,
    pub initialized: AtomicBool,
    pub init_notify: Notify,
    last_activity: StdMutex<Instant>,
    pub shutdown: Notify,
    pub shutting_down: AtomicBool,
    pub transport: StdMutex<TransportMode>,
    pub(crate) reconnect_attempts: AtomicU32,
    events_tx: broadcast::Sender<Frame>,
}

/// A connected real-time client. Cheaply cloneable; every clone shares the
/// same connection, in-flight map, and subscription state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: std::sync::Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig, context_store: Box<dyn ContextStore>) -> Self {
        let http = reqwest::Client::new();
        let token = StdMutex::new(context_store.load().and_then(|ctx| ctx["token"].as_str().map(str::to_owned)));
        let transport = config.transport;
        let inner = ClientInner {
            config,
            http,
            inflight: InFlightMap::new(),
            subscriptions: SubscriptionBook::new(),
            pending: PendingBatch::new(),
            flush_armed: AtomicBool::new(false),
            ws_tx: Mutex::new(None),
            token,
            context_store,
            initialized: AtomicBool::new(false),
            init_notify: Notify::new(),
            last_activity: StdMutex::new(Instant::now()),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            transport: StdMutex::new(transport),
            reconnect_attempts: AtomicU32::new(0),
            events_tx: broadcast::channel(256).0,
        };
        let client = Self { inner: std::sync::Arc::new(inner) };
        match transport {
            TransportMode::WebSocket => client.spawn_ws_loop(),
            TransportMode::HttpSse => client.spawn_sse_loop(),
            TransportMode::HttpOnly => {}
        }
        client
    }

    fn spawn_ws_loop(&self) {
        tokio::spawn(ws_loop::run(self.clone()));
    }

    /// Keeps an SSE stream open for `HTTP_SSE` mode, retrying with the same
    /// jittered backoff as the WebSocket loop on disconnect.
    fn spawn_sse_loop(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                if client.inner.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let endpoint = client.inner.config.http_endpoint();
                let uuid = client.inner.config.client_uuid.clone();
                let dispatch_client = client.clone();
                let open_client = client.clone();
                let result = crate::http::run_sse_loop(
                    endpoint,
                    uuid,
                    move || open_client.inner.reconnect_attempts.store(0, Ordering::SeqCst),
                    move |frame| dispatch_client.dispatch_incoming(frame),
                )
                .await;
                if let Err(e) = result {
                    warn!(error = %e, "sse stream ended");
                }
                if client.inner.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let attempt = client.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay(attempt)) => {}
                    _ = client.inner.shutdown.notified() => return,
                }
            }
        });
    }

    pub fn transport_mode(&self) -> TransportMode {
        *self.inner.transport.lock().unwrap()
    }

    pub fn set_transport_mode(&self, mode: TransportMode) {
        let previous = {
            let mut current = self.inner.transport.lock().unwrap();
            let previous = *current;
            *current = mode;
            previous
        };
        if previous != mode {
            match mode {
                TransportMode::WebSocket => self.spawn_ws_loop(),
                TransportMode::HttpSse => self.spawn_sse_loop(),
                TransportMode::HttpOnly => {}
            }
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.inner.token.lock().unwrap() = token.clone();
        let mut ctx = self.inner.context_store.load().unwrap_or(serde_json::json!({}));
        if let (Value::Object(map), Some(token)) = (&mut ctx, token) {
            map.insert("token".into(), Value::String(token));
        }
        self.inner.context_store.save(&ctx);
        // Token changes force re-auth: drop the current transport so the
        // reconnect loop re-runs rpc:init with the new token.
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    pub fn touch_activity(&self) {
        *self.inner.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().unwrap().elapsed()
    }

    /// Spawns a background task that closes the transport once the
    /// configured idle window elapses with no [`Client::touch_activity`]
    /// call. No-op if the config sets no idle timeout.
    pub fn spawn_idle_watch(&self) {
        let Some(window) = self.inner.config.idle_timeout else { return };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if inner.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let idle = inner.last_activity.lock().unwrap().elapsed();
                if idle >= window {
                    warn!(?idle, "idle timeout elapsed, closing transport");
                    *inner.ws_tx.lock().await = None;
                    inner.initialized.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    pub async fn call(&self, method: &str, params: Option<Value>, options: CallOptions) -> Result<Value, ClientError> {
        self.touch_activity();
        if !options.ignore_init && !self.inner.initialized.load(Ordering::SeqCst) && method != "rpc:init" {
            let wait = options.timeout / 2;
            if tokio::time::timeout(wait, self.inner.init_notify.notified()).await.is_err()
                && !self.inner.initialized.load(Ordering::SeqCst)
            {
                return Err(ClientError::Timeout);
            }
        }

        let mut attempt = 0;
        loop {
            let outcome = self.call_once(method, params.clone(), &options).await;
            if outcome.is_ok() || attempt >= options.max_retries {
                return outcome;
            }
            attempt += 1;
            tokio::time::sleep(options.delay_between_retries).await;
        }
    }

    async fn call_once(&self, method: &str, params: Option<Value>, options: &CallOptions) -> Result<Value, ClientError> {
        let id = RequestId::new();
        let socket_ready = self.inner.ws_tx.lock().await.is_some();
        let route_http = options.http || (!socket_ready && options.http_fallback);

        if route_http {
            let token = self.inner.token.lock().unwrap().clone();
            let frame = post_method(
                &self.inner.http,
                crate::http::PostMethodRequest {
                    endpoint: &self.inner.config.http_endpoint(),
                    client_uuid: &self.inner.config.client_uuid,
                    token: token.as_deref(),
                    id,
                    method,
                    params,
                    void: false,
                },
            )
            .await?;
            return match frame {
                Some(Frame::Result { result, .. }) => Ok(result),
                Some(err @ Frame::Error { .. }) => Err(err.into()),
                Some(other) => Err(ClientError::Transport(format!("unexpected frame: {other:?}"))),
                None => Ok(Value::Null),
            };
        }

        let rx = self.inner.inflight.register(id, method.to_owned());
        self.send_ws(Frame::Method { id, method: method.to_owned(), params, void: None }).await?;
        match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                if let Some(method) = self.inner.inflight.forget(&id) {
                    warn!(%method, "call timed out waiting for a server response");
                }
                Err(ClientError::Timeout)
            }
        }
    }

    pub async fn void(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.touch_activity();
        let id = RequestId::new();
        let socket_ready = self.inner.ws_tx.lock().await.is_some();
        if !socket_ready {
            let token = self.inner.token.lock().unwrap().clone();
            post_method(
                &self.inner.http,
                crate::http::PostMethodRequest {
                    endpoint: &self.inner.config.http_endpoint(),
                    client_uuid: &self.inner.config.client_uuid,
                    token: token.as_deref(),
                    id,
                    method,
                    params,
                    void: true,
                },
            )
            .await?;
            return Ok(());
        }
        self.send_ws(Frame::Method { id, method: method.to_owned(), params, void: Some(true) }).await
    }

    pub(crate) async fn send_ws(&self, frame: Frame) -> Result<(), ClientError> {
        let guard = self.inner.ws_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::Disconnected),
            None => Err(ClientError::Disconnected),
        }
    }

    pub fn subscribe(&self, channel: &str, event: &str) {
        self.inner.pending.add(channel, event);
        self.arm_flush();
    }

    pub fn unsubscribe(&self, channel: &str, event: &str) {
        self.inner.pending.remove(channel, event);
        self.arm_flush();
    }

    fn arm_flush(&self) {
        if self.inner.flush_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.inner.flush_armed.store(false, Ordering::SeqCst);
            client.flush_subscriptions().await;
        });
    }

    async fn flush_subscriptions(&self) {
        let (on, off) = self.inner.pending.drain();
        for (channel, events) in on {
            let events: Vec<String> = events.into_iter().collect();
            let params = serde_json::json!({ "events": events, "channel": channel });
            let timeout = CallOptions { timeout: Duration::from_secs(5), ..Default::default() };
            match self.call("rpc:on", Some(params), timeout).await {
                Ok(_) => self.inner.subscriptions.confirm_on(&channel, &events),
                Err(e) => warn!(%channel, error = %e, "subscribe flush failed"),
            }
        }
        for (channel, events) in off {
            let events: Vec<String> = events.into_iter().collect();
            let params = serde_json::json!({ "events": events, "channel": channel });
            let timeout = CallOptions { timeout: Duration::from_secs(5), ..Default::default() };
            match self.call("rpc:off", Some(params), timeout).await {
                Ok(_) => self.inner.subscriptions.confirm_off(&channel, &events),
                Err(e) => warn!(%channel, error = %e, "unsubscribe flush failed"),
            }
        }
    }

    /// Runs `rpc:init` with the persisted token (if any) and marks the
    /// client initialized on success. Called by the reconnect loop right
    /// after SETUP on every successful (re)connect.
    pub(crate) async fn authenticate(&self) -> Result<(), ClientError> {
        let token = self.inner.token.lock().unwrap().clone();
        let params = token.map(|t| serde_json::json!({ "token": t }));
        let options = CallOptions { ignore_init: true, ..Default::default() };
        self.call("rpc:init", params, options).await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.init_notify.notify_waiters();
        Ok(())
    }

    /// Re-issues one `rpc:on` per channel the client believes it holds.
    /// Called by the reconnect loop after a fresh `rpc:init`.
    pub(crate) async fn resubscribe_all_channels(&self) {
        for (channel, events) in self.inner.subscriptions.snapshot() {
            let params = serde_json::json!({ "events": events, "channel": channel });
            if let Err(e) = self.call("rpc:on", Some(params), CallOptions::default()).await {
                warn!(%channel, error = %e, "resubscribe failed");
            }
        }
    }

    /// Subscribes to the stream of `EVENT` frames the server delivers for
    /// whatever channels this client has subscribed to.
    pub fn events(&self) -> broadcast::Receiver<Frame> {
        self.inner.events_tx.subscribe()
    }

    /// Routes one frame received over either transport: `RESULT`/`ERROR`
    /// complete an in-flight call, `EVENT` is broadcast to [`Client::events`]
    /// subscribers. `HEARTBEAT` never reaches here — `ws_loop`'s reader
    /// intercepts it to echo it back and reset the missed-heartbeat clock
    /// before this is called; the arm below is just the inert fallback.
    pub(crate) fn dispatch_incoming(&self, frame: Frame) {
        match frame {
            Frame::Result { id, result, .. } => self.inner.inflight.complete(id, Ok(result)),
            err @ Frame::Error { id: Some(id), .. } => self.inner.inflight.complete(id, Err(err.into())),
            Frame::Error { id: None, message, .. } => warn!(%message, "unsolicited server error"),
            event @ Frame::Event { .. } => {
                let _ = self.inner.events_tx.send(event);
            }
            Frame::Heartbeat | Frame::Setup { .. } | Frame::Method { .. } => {}
        }
    }

    pub fn disconnect(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        self.inner.inflight.fail_all(ClientError::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_store::NullContextStore;

    #[tokio::test]
    async fn http_only_call_without_a_server_reports_transport_error() {
        let config = ClientConfig {
            transport: TransportMode::HttpOnly,
            ..ClientConfig::new("http://127.0.0.1:1", "ws://127.0.0.1:1/ws", "test-client")
        };
        let client = Client::new(config, Box::new(NullContextStore));
        let result = client.call("ping", None, CallOptions { ignore_init: true, ..Default::default() }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn touch_activity_resets_the_idle_clock() {
        let config = ClientConfig::new("http://127.0.0.1:1", "ws://127.0.0.1:1/ws", "test-client");
        let client = Client::new(config, Box::new(NullContextStore));
        std::thread::sleep(Duration::from_millis(20));
        client.touch_activity();
        assert!(client.idle_for() < Duration::from_millis(20));
    }
}
