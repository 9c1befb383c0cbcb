//! End-to-end test of the HTTP POST + SSE pairing: a subscription made over
//! POST (carrying `x-client-id`) must deliver its events over that client's
//! SSE stream rather than the POST response.

use realtime_core::EventOptions;
use realtime_server::config::ServerConfig;
use realtime_server::AppState;
use serde_json::json;
use std::time::Duration;

async fn spawn_server() -> (String, AppState) {
    let state = AppState::new(&ServerConfig::default()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = realtime_server::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .unwrap();
    });
    (format!("http://{}", addr), state)
}

#[tokio::test]
async fn subscription_over_post_delivers_event_over_sse() {
    let (base, state) = spawn_server().await;
    state.dispatcher.add_event("tick", EventOptions::default()).await;

    let client_id = "44444444-4444-4444-4444-444444444444";
    let http = reqwest::Client::new();

    let mut sse_resp = http
        .get(format!("{base}/__h"))
        .header("x-client-id", client_id)
        .send()
        .await
        .unwrap();
    assert!(sse_resp.status().is_success());

    // give the SSE handler a moment to register the session before the POST
    // looks it up by x-client-id.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let post_resp = http
        .post(format!("{base}/__h"))
        .header("x-client-id", client_id)
        .json(&json!({
            "context": {},
            "payload": {
                "type": "METHOD",
                "id": "55555555555555555555555555555555",
                "method": "rpc:on",
                "params": {"events": ["tick"], "channel": "room-1"}
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(post_resp.status(), reqwest::StatusCode::ACCEPTED);

    // The rpc:on call's own RESULT frame arrives over this same SSE stream
    // first, since it was dispatched against the persistent session.
    let subscribe_ack = tokio::time::timeout(Duration::from_secs(2), sse_resp.chunk())
        .await
        .expect("timed out waiting for rpc:on result")
        .unwrap()
        .expect("stream ended before the subscribe result");
    assert!(String::from_utf8(subscribe_ack.to_vec()).unwrap().contains("\"RESULT\""));

    state.dispatcher.emit("room-1", "tick", Some(json!({"n": 7}))).await;

    let chunk = tokio::time::timeout(Duration::from_secs(2), sse_resp.chunk())
        .await
        .expect("timed out waiting for SSE event")
        .unwrap()
        .expect("stream ended without an event");
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.contains("\"EVENT\""), "expected an EVENT frame, got: {text}");
    assert!(text.contains("\"tick\""));
    assert!(text.contains("room-1"));
}
