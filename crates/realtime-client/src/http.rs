//! HTTP POST single-shot calls, and the SSE stream used by `HTTP_SSE`
//! transport mode to receive events and (per the server's persistent-
//! session design) the results of calls made while that stream is open.

use serde_json::{json, Value};
use wire_protocol::{Frame, RequestId};

use crate::errors::ClientError;

#[derive(serde::Serialize)]
struct HttpEnvelope {
    context: Value,
    payload: Frame,
}

/// One HTTP POST call: the method frame plus the connection identity it
/// travels under.
pub struct PostMethodRequest<'a> {
    pub endpoint: &'a str,
    pub client_uuid: &'a str,
    pub token: Option<&'a str>,
    pub id: RequestId,
    pub method: &'a str,
    pub params: Option<Value>,
    pub void: bool,
}

/// Sends one METHOD frame over HTTP POST and returns the frame the server
/// handed back directly in the response. Returns `Ok(None)` for a `void`
/// call or when routed against a persistent SSE session (202 Accepted,
/// no body — the result arrives over that session's SSE stream instead).
pub async fn post_method(http: &reqwest::Client, request: PostMethodRequest<'_>) -> Result<Option<Frame>, ClientError> {
    let envelope = HttpEnvelope {
        context: request.token.map(|t| json!({ "token": t })).unwrap_or(json!({})),
        payload: Frame::Method {
            id: request.id,
            method: request.method.to_owned(),
            params: request.params,
            void: request.void.then_some(true),
        },
    };

    let mut req = http
        .post(request.endpoint)
        .header("x-client-id", request.client_uuid)
        .json(&envelope);
    if let Some(token) = request.token {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await.map_err(|e| ClientError::Transport(e.to_string()))?;
    match resp.status() {
        reqwest::StatusCode::ACCEPTED | reqwest::StatusCode::NO_CONTENT => Ok(None),
        status if status.is_success() => {
            let frame: Frame = resp.json().await.map_err(|e| ClientError::Transport(e.to_string()))?;
            Ok(Some(frame))
        }
        status => Err(ClientError::Transport(format!("unexpected status {status}"))),
    }
}

/// Opens the SSE stream at `{endpoint}` carrying `x-client-id`, and calls
/// `on_frame` for every decoded frame until the stream ends or errors.
pub async fn run_sse_loop(
    endpoint: String,
    client_uuid: String,
    mut on_open: impl FnMut() + Send,
    mut on_frame: impl FnMut(Frame) + Send,
) -> Result<(), ClientError> {
    use futures_util::StreamExt;
    use reqwest_eventsource::{Event, EventSource};

    let client = reqwest::Client::new();
    let req = client.get(&endpoint).header("x-client-id", &client_uuid);
    let mut source = EventSource::new(req).map_err(|e| ClientError::Transport(e.to_string()))?;

    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => on_open(),
            Ok(Event::Message(message)) => {
                if message.data == "keepalive" {
                    continue;
                }
                if let Ok(frame) = wire_protocol::decode(message.data.as_bytes()) {
                    on_frame(frame);
                }
            }
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(e) => return Err(ClientError::Transport(e.to_string())),
        }
    }
    Ok(())
}
