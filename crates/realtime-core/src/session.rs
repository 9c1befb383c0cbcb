//! A connected peer's authentication state and outbound frame queue.
//!
//! Mirrors the teacher's `AppState`/session-tracking pattern (double-checked
//! locking over a shared map) but scoped to a single peer: auth state lives
//! behind an `RwLock` so `rpc:init`/`rpc:logout` can mutate it while
//! concurrent handlers read a snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use wire_protocol::{ErrorCode, Frame, RequestId};

use crate::ratelimit::{RateLimitConfig, RateLimiter};

pub struct Session {
    pub uuid: Uuid,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
    authenticated: AtomicBool,
    context: RwLock<Value>,
    user_id: RwLock<Option<String>>,
    outbound: mpsc::UnboundedSender<Frame>,
    pub rate_limiter: Arc<RateLimiter>,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Session {
    /// Builds a session with its own private rate limiter — the normal
    /// case for a WebSocket or SSE connection, which lives as long as one
    /// session and needs no sharing.
    pub fn new(
        uuid: Uuid,
        outbound: mpsc::UnboundedSender<Frame>,
        rate_limit: RateLimitConfig,
        remote_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self::with_rate_limiter(uuid, outbound, Arc::new(RateLimiter::new(rate_limit)), remote_address, user_agent)
    }

    /// Builds a session against a caller-supplied, possibly shared, rate
    /// limiter — used for transient HTTP-POST sessions keyed on a stable
    /// per-caller identity (e.g. remote address) rather than getting a
    /// fresh limiter on every single request.
    pub fn with_rate_limiter(
        uuid: Uuid,
        outbound: mpsc::UnboundedSender<Frame>,
        rate_limiter: Arc<RateLimiter>,
        remote_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Session {
            uuid,
            remote_address,
            user_agent,
            authenticated: AtomicBool::new(false),
            context: RwLock::new(Value::Object(serde_json::Map::new())),
            user_id: RwLock::new(None),
            outbound,
            rate_limiter,
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Records fresh activity from this peer. HTTP POST and SSE transports
    /// call this on every request so the idle-close sweep can tell apart a
    /// quiet-but-alive client from an abandoned one.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("session mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("session mutex poisoned").elapsed()
    }

    /// Pushes a frame onto the session's outbound queue. Returns `false`
    /// if the peer's writer task has already shut down.
    pub fn send(&self, frame: Frame) -> bool {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(session = %self.uuid, "send to closed session dropped");
            return false;
        }
        true
    }

    pub fn result(&self, id: RequestId, value: Value) -> bool {
        self.send(Frame::Result {
            id,
            method: None,
            result: value,
        })
    }

    pub fn error(&self, id: Option<RequestId>, code: ErrorCode) -> bool {
        self.send(Frame::Error {
            id,
            message: code.to_string(),
            stack: None,
            errors: None,
        })
    }

    pub fn send_event(&self, channel: &str, event: &str, params: Option<Value>) -> bool {
        self.send(Frame::Event {
            id: RequestId::new(),
            channel: channel.to_string(),
            event: event.to_string(),
            params,
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn set_authenticated(&self, context: Value, user_id: Option<String>) {
        *self.context.write().await = context;
        *self.user_id.write().await = user_id;
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub async fn clear_authentication(&self) {
        *self.context.write().await = Value::Object(serde_json::Map::new());
        *self.user_id.write().await = None;
        self.authenticated.store(false, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub async fn context_snapshot(&self) -> Value {
        self.context.read().await.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(Uuid::new_v4(), tx, RateLimitConfig::default(), None, None),
            rx,
        )
    }

    #[tokio::test]
    async fn starts_unauthenticated_with_empty_context() {
        let (session, _rx) = session();
        assert!(!session.is_authenticated());
        assert_eq!(session.context_snapshot().await, Value::Object(Default::default()));
    }

    #[tokio::test]
    async fn authentication_round_trip() {
        let (session, _rx) = session();
        session
            .set_authenticated(serde_json::json!({"role": "admin"}), Some("u1".into()))
            .await;
        assert!(session.is_authenticated());
        assert_eq!(session.user_id().await, Some("u1".into()));
        session.clear_authentication().await;
        assert!(!session.is_authenticated());
        assert_eq!(session.user_id().await, None);
    }

    #[tokio::test]
    async fn send_after_receiver_drop_reports_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(Uuid::new_v4(), tx, RateLimitConfig::default(), None, None);
        drop(rx);
        assert!(!session.result(RequestId::new(), Value::Null));
    }
}
