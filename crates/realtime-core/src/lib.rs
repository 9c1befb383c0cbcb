//! Transport-agnostic core of the real-time RPC/pub-sub server: sessions,
//! method and event registries, the dispatch algorithm, rate limiting,
//! result caching, and the pluggable cluster relay trait.
//!
//! Nothing in this crate knows about WebSocket, HTTP, or SSE — those live
//! with the binary that wires a [`Dispatcher`] to `axum`.

mod cache;
mod channels;
mod context;
mod dispatcher;
mod errors;
mod methods;
mod notify;
mod ratelimit;
mod relay;
mod session;

pub use channels::{ChannelJoinFn, ChannelRef, EventDef, EventOptions, EventRegistry, ShouldSubscribeFn};
pub use context::CallContext;
pub use dispatcher::{AuthFn, AuthFuture, Dispatcher, DispatcherConfig, Presence};
pub use errors::DispatchError;
pub use methods::{Handler, HandlerFuture, MethodDef, MethodInfo, MethodOptions, MethodRegistry, Middleware, MiddlewareFuture, SchemaValidator};
pub use notify::{InternalBus, InternalEvent};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use relay::ClusterBus;
pub use session::Session;

pub use wire_protocol::{decode, encode, ErrorCode, Frame, ParseError, RequestId, NO_CHANNEL};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn new_session(dispatcher: &Dispatcher) -> (Arc<Session>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(Uuid::new_v4(), tx, dispatcher.config.rate_limit, None, None));
        (session, rx)
    }

    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        let (session, mut rx) = new_session(&dispatcher);
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "nope".into(),
                    params: None,
                    void: None,
                },
            )
            .await;
        match rx.recv().await.unwrap() {
            Frame::Error { message, .. } => assert_eq!(message, "Method Not Found"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn protected_method_denies_until_authenticated() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        dispatcher
            .add_method(
                "whoami",
                Arc::new(|ctx: CallContext, _params: Value| {
                    Box::pin(async move { Ok(ctx.session_context) }) as HandlerFuture
                }),
                MethodOptions {
                    protected: true,
                    ..Default::default()
                },
            )
            .await;
        dispatcher
            .set_auth(Arc::new(|_params: Value| {
                Box::pin(async move { Some(json!({"user": {"id": "u1"}})) }) as AuthFuture
            }))
            .await;

        let (session, mut rx) = new_session(&dispatcher);
        let id = RequestId::new();
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id,
                    method: "whoami".into(),
                    params: None,
                    void: None,
                },
            )
            .await;
        match rx.recv().await.unwrap() {
            Frame::Error { message, .. } => assert_eq!(message, "Method Forbidden"),
            other => panic!("unexpected frame: {other:?}"),
        }

        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "rpc:init".into(),
                    params: Some(json!({"token": "t"})),
                    void: None,
                },
            )
            .await;
        let _ = rx.recv().await.unwrap();

        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "whoami".into(),
                    params: None,
                    void: None,
                },
            )
            .await;
        match rx.recv().await.unwrap() {
            Frame::Result { result, .. } => assert_eq!(result["user"]["id"], "u1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn void_call_suppresses_every_response_frame() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        dispatcher
            .add_method(
                "noop",
                Arc::new(|_ctx: CallContext, _params: Value| Box::pin(async move { Ok(Value::Null) }) as HandlerFuture),
                MethodOptions::default(),
            )
            .await;
        let (session, mut rx) = new_session(&dispatcher);
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "noop".into(),
                    params: None,
                    void: Some(true),
                },
            )
            .await;
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "missing".into(),
                    params: None,
                    void: Some(true),
                },
            )
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_then_emit_delivers_to_subscriber_only() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).await;
        dispatcher.add_event("tick", EventOptions::default()).await;

        let (subscriber, mut sub_rx) = new_session(&dispatcher);
        let (bystander, mut bystander_rx) = new_session(&dispatcher);

        dispatcher
            .handle_frame(
                &subscriber,
                Frame::Method {
                    id: RequestId::new(),
                    method: "rpc:on".into(),
                    params: Some(json!({"events": ["tick"], "channel": "room-1"})),
                    void: None,
                },
            )
            .await;
        let _ = sub_rx.recv().await.unwrap();

        dispatcher.emit("room-1", "tick", Some(json!({"n": 1}))).await;

        match sub_rx.recv().await.unwrap() {
            Frame::Event { channel, event, params, .. } => {
                assert_eq!(channel, "room-1");
                assert_eq!(event, "tick");
                assert_eq!(params.unwrap()["n"], 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(bystander_rx.try_recv().is_err());
        let _ = &bystander;
    }

    #[tokio::test]
    async fn rate_limit_exceeded_surfaces_as_error() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            rate_limit: RateLimitConfig {
                max_requests: 1,
                interval: std::time::Duration::from_secs(60),
            },
            ..Default::default()
        })
        .await;
        let (session, mut rx) = new_session(&dispatcher);
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "keep:alive".into(),
                    params: None,
                    void: None,
                },
            )
            .await;
        let _ = rx.recv().await.unwrap();
        dispatcher
            .handle_frame(
                &session,
                Frame::Method {
                    id: RequestId::new(),
                    method: "keep:alive".into(),
                    params: None,
                    void: None,
                },
            )
            .await;
        match rx.recv().await.unwrap() {
            Frame::Error { message, .. } => assert_eq!(message, "Rate Limit Exceeded"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
