//! The `Dispatcher`: owns the method/event registries and sessions, and
//! implements the per-call routing algorithm every transport funnels
//! through.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;
use wire_protocol::{ErrorCode, Frame, RequestId};

use crate::cache::{cache_key, ResultCache};
use crate::channels::{EventOptions, EventRegistry};
use crate::context::{self, CallContext};
use crate::errors::{DispatchError, FrameError};
use crate::methods::{Handler, MethodOptions, MethodRegistry};
use crate::notify::{internal_bus, InternalBus, InternalEvent};
use crate::ratelimit::RateLimitConfig;
use crate::relay::ClusterBus;
use crate::session::Session;

pub type AuthFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;
pub type AuthFn = Arc<dyn Fn(Value) -> AuthFuture + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Presence {
    pub connections: usize,
    pub distinct_users: usize,
}

pub struct DispatcherConfig {
    pub rate_limit: RateLimitConfig,
    pub allowed_context_keys: Vec<String>,
    pub accept_connections: Arc<AtomicBool>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            rate_limit: RateLimitConfig::default(),
            allowed_context_keys: Vec::new(),
            accept_connections: Arc::new(AtomicBool::new(true)),
        }
    }
}

pub struct Dispatcher {
    pub methods: Arc<MethodRegistry>,
    pub events: Arc<EventRegistry>,
    cache: Arc<ResultCache>,
    pub internal: InternalBus,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    auth: RwLock<Option<AuthFn>>,
    relay: RwLock<Option<Arc<dyn ClusterBus>>>,
    pub config: DispatcherConfig,
}

impl Dispatcher {
    pub async fn new(config: DispatcherConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher {
            methods: Arc::new(MethodRegistry::new()),
            events: Arc::new(EventRegistry::new()),
            cache: Arc::new(ResultCache::new()),
            internal: internal_bus(),
            sessions: RwLock::new(HashMap::new()),
            auth: RwLock::new(None),
            relay: RwLock::new(None),
            config,
        });
        register_builtin_methods(&dispatcher).await;
        dispatcher
    }

    /// Configures authentication and, per the design, only then registers
    /// `rpc:login` — it exists solely to let the HTTP transport perform the
    /// same authentication exchange and set a cookie on the response.
    pub async fn set_auth(self: &Arc<Self>, auth: AuthFn) {
        *self.auth.write().await = Some(auth);
        let weak = Arc::downgrade(self);
        self.add_method(
            "rpc:login",
            Arc::new(move |ctx: CallContext, params: Value| {
                let weak = weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let auth_fn = dispatcher
                        .auth
                        .read()
                        .await
                        .clone()
                        .ok_or_else(|| DispatchError::internal("authentication not configured"))?;
                    match auth_fn(params).await {
                        Some(context) => {
                            let user_id = extract_user_id(&context);
                            ctx.session.set_authenticated(context.clone(), user_id.clone()).await;
                            let _ = dispatcher.internal.send(InternalEvent::Authentication {
                                session: ctx.session.uuid,
                                user_id,
                            });
                            Ok(project_keys(&context, &dispatcher.config.allowed_context_keys))
                        }
                        None => Err(DispatchError::Public(
                            wire_protocol::ErrorCode::AuthenticationFailed.to_string(),
                            None,
                        )),
                    }
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;
    }

    pub async fn attach_relay(&self, bus: Arc<dyn ClusterBus>) {
        *self.relay.write().await = Some(bus);
    }

    pub async fn add_method(&self, name: impl Into<String>, handler: Handler, options: MethodOptions) {
        self.methods.add_method(name, handler, options).await;
    }

    pub async fn add_event(&self, name: impl Into<String>, options: EventOptions) {
        self.events.add_event(name, options).await;
    }

    pub fn accepting_connections(&self) -> bool {
        self.config.accept_connections.load(Ordering::SeqCst)
    }

    /// Registers a newly connected session, resolving a `SETUP` uuid
    /// collision by assigning a fresh one and continuing the session
    /// rather than rejecting the connection.
    pub async fn register_session(&self, requested_uuid: Uuid, session_factory: impl FnOnce(Uuid) -> Arc<Session>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let uuid = if sessions.contains_key(&requested_uuid) {
            tracing::warn!(requested = %requested_uuid, "setup uuid collision, assigning a fresh one");
            let mut candidate = Uuid::new_v4();
            while sessions.contains_key(&candidate) {
                candidate = Uuid::new_v4();
            }
            candidate
        } else {
            requested_uuid
        };
        let session = session_factory(uuid);
        sessions.insert(uuid, session.clone());
        let _ = self.internal.send(InternalEvent::Connection { session: uuid });
        session
    }

    pub async fn remove_session(&self, uuid: Uuid) {
        self.sessions.write().await.remove(&uuid);
        self.events.unsubscribe_everywhere(uuid).await;
        let _ = self.internal.send(InternalEvent::SessionClosed { session: uuid });
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get_session(&self, uuid: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&uuid).cloned()
    }

    pub async fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Connection and distinct-authenticated-user counts for this instance.
    /// Cluster-wide aggregation is the caller's responsibility (the relay
    /// has no shared presence registry of its own, see `DESIGN.md`).
    pub async fn presence(&self) -> Presence {
        let sessions = self.sessions.read().await;
        let mut users = std::collections::HashSet::new();
        for session in sessions.values() {
            if let Some(user_id) = session.user_id().await {
                users.insert(user_id);
            }
        }
        Presence {
            connections: sessions.len(),
            distinct_users: users.len(),
        }
    }

    pub async fn emit(&self, channel: &str, event: &str, params: Option<Value>) {
        let relay = self.relay.read().await.clone();
        self.events.emit(channel, event, params, relay.as_ref()).await;
    }

    /// Delivers a bus-originated event locally only; the relay has already
    /// filtered out its own echo via instance-id tagging.
    pub async fn receive_from_bus(&self, channel: &str, event: &str, params: Option<Value>) {
        self.events.local_emit(channel, event, params).await;
    }

    /// Schedules an emit on the next scheduler tick rather than running it
    /// inline.
    pub fn defer(self: &Arc<Self>, channel: String, event: String, params: Option<Value>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.emit(&channel, &event, params).await;
        });
    }

    /// Entry point every transport calls with a decoded frame.
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<Session>, frame: Frame) {
        match frame {
            Frame::Method {
                id,
                method,
                params,
                void,
            } => {
                self.dispatch_method(session.clone(), id, method, params, void.unwrap_or(false))
                    .await;
            }
            Frame::Heartbeat => {
                session.send(Frame::Heartbeat);
            }
            Frame::Setup { .. } => {
                session.error(None, ErrorCode::InvalidRequest);
            }
            Frame::Result { .. } | Frame::Error { .. } | Frame::Event { .. } => {
                session.error(None, ErrorCode::InvalidRequest);
            }
        }
    }

    async fn dispatch_method(
        self: &Arc<Self>,
        session: Arc<Session>,
        id: RequestId,
        method: String,
        params: Option<Value>,
        void: bool,
    ) {
        let started = Instant::now();
        let outcome = self.run_method(&session, &method, params).await;

        match outcome {
            Ok((final_params, result)) => {
                if !void {
                    session.result(id, result.clone());
                }
                let _ = self.internal.send(InternalEvent::MethodExecution {
                    name: method,
                    elapsed_ms: started.elapsed().as_millis(),
                    params: final_params,
                    result,
                });
            }
            Err(err) => {
                if !void {
                    session.send(err.to_frame(Some(id)));
                }
            }
        }
    }

    async fn run_method(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Value, Value), FrameError> {
        if !session.rate_limiter.check() {
            return Err(FrameError::Known(ErrorCode::RateLimitExceeded, None));
        }

        let def = self
            .methods
            .get(method)
            .await
            .ok_or(FrameError::Known(ErrorCode::MethodNotFound, None))?;

        if def.protected && !session.is_authenticated() {
            return Err(FrameError::Known(ErrorCode::MethodForbidden, None));
        }

        let mut current = params.unwrap_or(Value::Null);

        if let Some(schema) = &def.schema {
            if let Err(detail) = schema(&current) {
                return Err(FrameError::Known(ErrorCode::InvalidParams, Some(detail)));
            }
        }

        for middleware in &def.middleware {
            let next = middleware(current.clone()).await.map_err(FrameError::from)?;
            current = merge_params(current, next);
        }

        if let Some(ttl) = def.cache_ttl {
            let key = cache_key(method, &current);
            if let Some(cached) = self.cache.get(&key) {
                return Ok((current, cached));
            }
            let result = self.invoke(session, &def, current.clone()).await?;
            self.cache.put(key, result.clone(), ttl);
            return Ok((current, result));
        }

        let result = self.invoke(session, &def, current.clone()).await?;
        Ok((current, result))
    }

    async fn invoke(
        &self,
        session: &Arc<Session>,
        def: &crate::methods::MethodDef,
        params: Value,
    ) -> Result<Value, FrameError> {
        let ctx = CallContext {
            execution_id: Uuid::new_v4(),
            session: session.clone(),
            session_context: session.context_snapshot().await,
        };
        let handler = def.handler.clone();
        let fut = context::scope(ctx.clone(), handler(ctx, params));
        let result = match def.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(DispatchError::internal("handler timed out")),
            },
            None => fut.await,
        };
        result.map_err(FrameError::from)
    }
}

fn merge_params(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k, v);
            }
            Value::Object(base_map)
        }
        (_, replacement) => replacement,
    }
}

fn extract_user_id(context: &Value) -> Option<String> {
    context
        .get("user")
        .and_then(|u| u.get("id"))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn project_keys(context: &Value, allowed: &[String]) -> Value {
    if allowed.is_empty() {
        return context.clone();
    }
    match context {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for key in allowed {
                if let Some(value) = map.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

async fn register_builtin_methods(dispatcher: &Arc<Dispatcher>) {
    let weak: Weak<Dispatcher> = Arc::downgrade(dispatcher);

    let init_weak = weak.clone();
    dispatcher
        .add_method(
            "rpc:init",
            Arc::new(move |ctx: CallContext, params: Value| {
                let weak = init_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let auth_fn = dispatcher.auth.read().await.clone();
                    if let Some(auth_fn) = auth_fn {
                        match auth_fn(params).await {
                            Some(context) => {
                                let user_id = extract_user_id(&context);
                                ctx.session.set_authenticated(context, user_id.clone()).await;
                                let _ = dispatcher.internal.send(InternalEvent::Authentication {
                                    session: ctx.session.uuid,
                                    user_id,
                                });
                            }
                            None => ctx.session.clear_authentication().await,
                        }
                    }
                    let snapshot = ctx.session.context_snapshot().await;
                    Ok(project_keys(&snapshot, &dispatcher.config.allowed_context_keys))
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    let logout_weak = weak.clone();
    dispatcher
        .add_method(
            "rpc:logout",
            Arc::new(move |ctx: CallContext, _params: Value| {
                let weak = logout_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    ctx.session.clear_authentication().await;
                    let _ = dispatcher.internal.send(InternalEvent::Logout {
                        session: ctx.session.uuid,
                    });
                    Ok(Value::Null)
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    let on_weak = weak.clone();
    dispatcher
        .add_method(
            "rpc:on",
            Arc::new(move |ctx: CallContext, params: Value| {
                let weak = on_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let (events, channel) = parse_on_off_params(params)?;
                    let mut out = serde_json::Map::new();
                    for ev in events {
                        let ok = dispatcher.events.try_subscribe(&channel, &ev, &ctx.session).await;
                        out.insert(ev, Value::Bool(ok));
                    }
                    Ok(Value::Object(out))
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    let off_weak = weak.clone();
    dispatcher
        .add_method(
            "rpc:off",
            Arc::new(move |ctx: CallContext, params: Value| {
                let weak = off_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let (events, channel) = parse_on_off_params(params)?;
                    let mut out = serde_json::Map::new();
                    for ev in events {
                        dispatcher.events.unsubscribe(&channel, &ev, ctx.session.uuid).await;
                        out.insert(ev, Value::Bool(true));
                    }
                    Ok(Value::Object(out))
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    dispatcher
        .add_method(
            "keep:alive",
            Arc::new(|_ctx: CallContext, _params: Value| {
                Box::pin(async move { Ok(Value::Bool(true)) }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    let list_weak = weak.clone();
    dispatcher
        .add_method(
            "list:methods",
            Arc::new(move |_ctx: CallContext, _params: Value| {
                let weak = list_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let list = dispatcher.methods.list().await;
                    Ok(serde_json::to_value(list).expect("method info is always serializable"))
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;

    let probe_weak = weak.clone();
    dispatcher
        .add_method(
            "event:probe",
            Arc::new(move |ctx: CallContext, params: Value| {
                let weak = probe_weak.clone();
                Box::pin(async move {
                    let dispatcher = weak.upgrade().ok_or_else(|| DispatchError::internal("dispatcher gone"))?;
                    let event = params
                        .get("event")
                        .and_then(Value::as_str)
                        .ok_or_else(|| DispatchError::public("event is required"))?
                        .to_owned();
                    let channel = params
                        .get("channel")
                        .and_then(Value::as_str)
                        .unwrap_or(wire_protocol::NO_CHANNEL)
                        .to_owned();
                    let subscribed = dispatcher
                        .events
                        .session_subscribed(&channel, &event, ctx.session.uuid)
                        .await;
                    Ok(Value::Bool(subscribed))
                }) as crate::methods::HandlerFuture
            }),
            MethodOptions::default(),
        )
        .await;
}

fn parse_on_off_params(params: Value) -> Result<(Vec<String>, String), DispatchError> {
    let events = params
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| DispatchError::public("events must be an array of strings"))?
        .iter()
        .map(|v| v.as_str().map(str::to_owned))
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| DispatchError::public("events must be an array of strings"))?;
    let channel = params
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or(wire_protocol::NO_CHANNEL)
        .to_owned();
    Ok((events, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Captures every publish instead of talking to a real bus, so the
    /// dedup contract (`emit` publishes once, `receive_from_bus` never
    /// publishes at all) can be asserted without Redis.
    struct FakeBus {
        published: std::sync::Mutex<Vec<(String, String, Option<Value>)>>,
    }

    impl FakeBus {
        fn new() -> Self {
            FakeBus {
                published: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ClusterBus for FakeBus {
        async fn publish(&self, channel: &str, event: &str, params: Option<Value>) {
            self.published.lock().unwrap().push((channel.to_owned(), event.to_owned(), params));
        }
    }

    fn session() -> (Arc<Session>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Session::new(Uuid::new_v4(), tx, RateLimitConfig::default(), None, None)), rx)
    }

    #[tokio::test]
    async fn emit_with_relay_fans_out_locally_and_publishes_once() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        dispatcher.add_event("tick", EventOptions::default()).await;
        let bus = Arc::new(FakeBus::new());
        dispatcher.attach_relay(bus.clone()).await;

        let (session, mut rx) = session();
        dispatcher.events.try_subscribe("room-1", "tick", &session).await;

        dispatcher.emit("room-1", "tick", Some(serde_json::json!({"n": 1}))).await;

        match rx.recv().await.unwrap() {
            Frame::Event { channel, event, .. } => {
                assert_eq!(channel, "room-1");
                assert_eq!(event, "tick");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "local delivery should happen exactly once");
        assert_eq!(bus.published.lock().unwrap().len(), 1, "emit should publish to the bus exactly once");
    }

    #[tokio::test]
    async fn receive_from_bus_delivers_locally_without_publishing_back() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        dispatcher.add_event("tick", EventOptions::default()).await;
        let bus = Arc::new(FakeBus::new());
        dispatcher.attach_relay(bus.clone()).await;

        let (session, mut rx) = session();
        dispatcher.events.try_subscribe("room-1", "tick", &session).await;

        // Stands in for a bus message arriving from another instance — the
        // relay has already suppressed its own echo before calling this.
        dispatcher
            .receive_from_bus("room-1", "tick", Some(serde_json::json!({"n": 1})))
            .await;

        let _ = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err(), "bus-originated event should be delivered exactly once");
        assert!(
            bus.published.lock().unwrap().is_empty(),
            "receiving from the bus must never publish back to it"
        );
    }
}
