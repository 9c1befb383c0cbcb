//! The SSE transport: `GET /__h` with `x-client-id`. Registers a session
//! with no inbound channel — all further calls from this client arrive as
//! HTTP POSTs carrying the same `x-client-id`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use realtime_core::{encode, Session};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

/// A session is considered abandoned once its HTTP-POST activity has been
/// silent for this many multiples of the keep-alive interval.
const IDLE_MULTIPLE: u32 = 3;

enum StreamState {
    Active {
        rx: mpsc::UnboundedReceiver<realtime_core::Frame>,
        session: Arc<Session>,
        dispatcher: Arc<realtime_core::Dispatcher>,
        idle_window: std::time::Duration,
        next_id: Arc<AtomicU64>,
    },
    Done,
}

pub async fn handle(State(state): State<AppState>, ConnectInfo(remote): ConnectInfo<SocketAddr>, headers: HeaderMap) -> Response {
    let client_id = match headers.get("x-client-id").and_then(|v| v.to_str().ok()).and_then(|v| Uuid::parse_str(v).ok()) {
        Some(uuid) => uuid,
        None => return (StatusCode::BAD_REQUEST, "x-client-id header required").into_response(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let session = state
        .dispatcher
        .register_session(client_id, |uuid| {
            Arc::new(Session::new(
                uuid,
                tx,
                state.dispatcher.config.rate_limit,
                Some(remote.to_string()),
                None,
            ))
        })
        .await;

    let idle_window = state.keep_alive_interval * IDLE_MULTIPLE;
    let next_id = Arc::new(AtomicU64::new(0));
    let initial = StreamState::Active {
        rx,
        session,
        dispatcher: state.dispatcher.clone(),
        idle_window,
        next_id,
    };

    let stream = stream::unfold(initial, next_sse_event);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive_interval).text("keepalive")).into_response()
}

async fn next_sse_event(state: StreamState) -> Option<(Result<Event, Infallible>, StreamState)> {
    let StreamState::Active {
        mut rx,
        session,
        dispatcher,
        idle_window,
        next_id,
    } = state
    else {
        return None;
    };

    loop {
        let remaining = idle_window.saturating_sub(session.idle_for());
        let wait = if remaining.is_zero() { std::time::Duration::from_millis(1) } else { remaining };
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(frame)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let payload = String::from_utf8(encode(&frame)).expect("frame encodes to valid utf8");
                let event = Event::default().id(id.to_string()).data(payload);
                return Some((
                    Ok(event),
                    StreamState::Active {
                        rx,
                        session,
                        dispatcher,
                        idle_window,
                        next_id,
                    },
                ));
            }
            Ok(None) => return None,
            Err(_) => {
                if session.idle_for() >= idle_window {
                    dispatcher.remove_session(session.uuid).await;
                    let event = Event::default().event("close").data("Server-side termination");
                    return Some((Ok(event), StreamState::Done));
                }
                // last_seen may have been bumped by a concurrent POST; loop
                // and recompute the wait.
            }
        }
    }
}
