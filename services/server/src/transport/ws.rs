//! The WebSocket transport: path `/helene-ws`, gated on
//! `Dispatcher::accepting_connections`, first frame must be `SETUP`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use realtime_core::{decode, encode, ErrorCode, Frame, Session};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    uuid: Option<String>,
}

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.dispatcher.accepting_connections() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not accepting connections").into_response();
    }
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.uuid, user_agent, remote))
}

async fn handle_socket(socket: WebSocket, state: AppState, query_uuid: Option<String>, user_agent: Option<String>, remote: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    let first_text = match tokio::time::timeout(SETUP_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let setup_uuid = match decode(first_text.as_bytes()) {
        Ok(Frame::Setup { uuid }) => Uuid::parse_str(&uuid).unwrap_or_else(|_| Uuid::new_v4()),
        _ => {
            let frame = Frame::error(None, ErrorCode::InvalidRequest, None);
            let _ = sink.send(Message::Text(String::from_utf8(encode(&frame)).unwrap())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    if let Some(raw) = &query_uuid {
        if Uuid::parse_str(raw).ok() != Some(setup_uuid) {
            tracing::debug!("ws query uuid does not match SETUP uuid; SETUP wins");
        }
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = state
        .dispatcher
        .register_session(setup_uuid, |uuid| {
            Arc::new(Session::new(
                uuid,
                outbound_tx,
                state.dispatcher.config.rate_limit,
                Some(remote.to_string()),
                user_agent,
            ))
        })
        .await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = String::from_utf8(encode(&frame)).expect("frame encodes to valid utf8");
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Sends a heartbeat every `keep_alive_interval` and, at the midpoint
    // between two sends, checks that the previous one was echoed back —
    // a peer that misses one full cycle is treated as dead and dropped.
    let mut heartbeat = tokio::time::interval(state.keep_alive_interval);
    heartbeat.tick().await;
    let mut echo_deadline = tokio::time::interval_at(
        tokio::time::Instant::now() + state.keep_alive_interval / 2,
        state.keep_alive_interval,
    );
    let mut awaiting_echo = false;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match decode(text.as_bytes()) {
                            Ok(Frame::Heartbeat) => awaiting_echo = false,
                            Ok(frame) => handle_inbound_frame(&state, &session, frame).await,
                            Err(_) => { session.send(Frame::error(None, ErrorCode::ParseError, None)); }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                session.send(Frame::Heartbeat);
                awaiting_echo = true;
            }
            _ = echo_deadline.tick() => {
                if awaiting_echo {
                    tracing::debug!(session = %session.uuid, "missed heartbeat echo, closing");
                    break;
                }
            }
        }
    }

    session.close();
    state.dispatcher.remove_session(session.uuid).await;
    writer.abort();
}

async fn handle_inbound_frame(state: &AppState, session: &Arc<Session>, frame: Frame) {
    // keep:alive bypasses the full dispatch pipeline (rate limiting,
    // middleware) since it exists purely to keep the socket warm.
    if let Frame::Method { id, method, void, .. } = &frame {
        if method == "keep:alive" {
            if !void.unwrap_or(false) {
                session.result(*id, serde_json::Value::Bool(true));
            }
            return;
        }
    }
    state.dispatcher.handle_frame(session, frame).await;
}
