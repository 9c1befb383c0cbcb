//! The HTTP POST single-shot transport: `POST /__h`.
//!
//! When the request carries an `x-client-id` matching a live SSE session,
//! the call is routed through that persistent session so a subscription
//! made here is honored by later `emit`s delivered over that session's SSE
//! stream — which also means the result/error frame for *that* call
//! arrives over SSE, not in this response. Design decision: the POST
//! response is `202 Accepted` with no body in that case, and carries the
//! result/error frame directly only for transient (no matching SSE
//! session) calls, which is the common case this endpoint exists for.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use realtime_core::{Frame, RateLimiter, RequestId, Session};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::extract_bearer;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HttpEnvelope {
    #[serde(default)]
    context: Value,
    payload: Frame,
}

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(envelope): Json<HttpEnvelope>,
) -> Response {
    let Frame::Method { id, method, params, void } = envelope.payload else {
        return (StatusCode::BAD_REQUEST, "payload must be a METHOD frame").into_response();
    };

    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    let persistent = match client_id {
        Some(uuid) => state.dispatcher.get_session(uuid).await,
        None => None,
    };

    let mut context = envelope.context;
    merge_token_into_context(&mut context, &headers);

    match persistent {
        Some(session) => {
            session.touch();
            // Only re-run rpc:init when this request actually carries context
            // worth applying (a token, or caller-supplied init data) — a
            // bare follow-up call with no context must not wipe out the
            // authentication a prior call on this same persistent session
            // already established.
            if !context_is_empty(&context) {
                state
                    .dispatcher
                    .handle_frame(
                        &session,
                        Frame::Method {
                            id: RequestId::new(),
                            method: "rpc:init".to_owned(),
                            params: Some(context),
                            void: Some(true),
                        },
                    )
                    .await;
            }
            state
                .dispatcher
                .handle_frame(&session, Frame::Method { id, method, params, void })
                .await;
            StatusCode::ACCEPTED.into_response()
        }
        None => {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let rate_limiter = anonymous_rate_limiter(&state, &remote).await;
            let session = Arc::new(Session::with_rate_limiter(
                Uuid::new_v4(),
                tx,
                rate_limiter,
                Some(remote.to_string()),
                None,
            ));
            state
                .dispatcher
                .handle_frame(
                    &session,
                    Frame::Method {
                        id: RequestId::new(),
                        method: "rpc:init".to_owned(),
                        params: Some(context),
                        void: Some(true),
                    },
                )
                .await;
            state
                .dispatcher
                .handle_frame(&session, Frame::Method { id, method, params, void })
                .await;
            match rx.try_recv() {
                Ok(frame) => (StatusCode::OK, Json(frame)).into_response(),
                Err(_) => StatusCode::NO_CONTENT.into_response(),
            }
        }
    }
}

/// Looks up (or creates) the rate limiter shared by every anonymous
/// HTTP-POST call from this remote address, so repeated calls from the
/// same caller are actually throttled together instead of each getting a
/// throwaway limiter with a fresh, empty window.
async fn anonymous_rate_limiter(state: &AppState, remote: &SocketAddr) -> Arc<RateLimiter> {
    let key = remote.ip().to_string();
    if let Some(limiter) = state.anonymous_rate_limiters.read().await.get(&key) {
        return limiter.clone();
    }
    let mut limiters = state.anonymous_rate_limiters.write().await;
    limiters
        .entry(key)
        .or_insert_with(|| Arc::new(RateLimiter::new(state.dispatcher.config.rate_limit)))
        .clone()
}

fn context_is_empty(context: &Value) -> bool {
    match context {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn merge_token_into_context(context: &mut Value, headers: &HeaderMap) {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));
    if let Some(token) = token {
        if let Value::Object(map) = context {
            map.entry("token").or_insert_with(|| Value::String(token.to_owned()));
        } else {
            *context = serde_json::json!({"token": token});
        }
    }
}
