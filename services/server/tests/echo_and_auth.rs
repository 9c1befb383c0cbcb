//! End-to-end tests against a real in-process server: WebSocket transport,
//! echo-style calls, and the protected-method auth flow.

use realtime_server::auth::{auth_fn, seeded_store};
use realtime_server::config::ServerConfig;
use realtime_server::AppState;
use serde_json::json;
use test_support::MockWsClient;
use wire_protocol::{Frame, RequestId};

async fn spawn_server() -> (std::net::SocketAddr, realtime_server::AppState) {
    let state = AppState::new(&ServerConfig::default()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = realtime_server::build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .unwrap();
    });
    (addr, state)
}

#[tokio::test]
async fn keep_alive_is_answered_without_full_dispatch() {
    let (addr, _state) = spawn_server().await;
    let url = format!("ws://{}/helene-ws", addr);
    let mut client = MockWsClient::connect(&url, "11111111-1111-1111-1111-111111111111")
        .await
        .unwrap();

    let id = RequestId::new();
    client
        .send_frame(&Frame::Method {
            id,
            method: "keep:alive".into(),
            params: None,
            void: None,
        })
        .await
        .unwrap();

    match client.recv_frame().await.unwrap() {
        Frame::Result { id: got, result, .. } => {
            assert_eq!(got, id);
            assert_eq!(result, json!(true));
        }
        other => panic!("expected Result, got {:?}", other),
    }
}

#[tokio::test]
async fn list_methods_reports_builtins() {
    let (addr, _state) = spawn_server().await;
    let url = format!("ws://{}/helene-ws", addr);
    let mut client = MockWsClient::connect(&url, "22222222-2222-2222-2222-222222222222")
        .await
        .unwrap();

    let id = RequestId::new();
    client
        .send_frame(&Frame::Method {
            id,
            method: "list:methods".into(),
            params: None,
            void: None,
        })
        .await
        .unwrap();

    match client.recv_frame().await.unwrap() {
        Frame::Result { result, .. } => {
            let names: Vec<String> = result
                .as_array()
                .unwrap()
                .iter()
                .map(|m| m["name"].as_str().unwrap().to_owned())
                .collect();
            assert!(names.contains(&"rpc:on".to_owned()));
            assert!(names.contains(&"rpc:off".to_owned()));
        }
        other => panic!("expected Result, got {:?}", other),
    }
}

#[tokio::test]
async fn protected_method_round_trips_through_rpc_init() {
    let (addr, state) = spawn_server().await;
    let store = seeded_store("a-valid-token", "user-1").await;
    state.dispatcher.set_auth(auth_fn(store)).await;
    state
        .dispatcher
        .add_method(
            "whoami",
            std::sync::Arc::new(|ctx, _params| {
                Box::pin(async move { Ok(ctx.session_context["user"]["id"].clone()) })
            }),
            realtime_core::MethodOptions {
                protected: true,
                ..Default::default()
            },
        )
        .await;

    let url = format!("ws://{}/helene-ws", addr);
    let mut client = MockWsClient::connect(&url, "33333333-3333-3333-3333-333333333333")
        .await
        .unwrap();

    let denied_id = RequestId::new();
    client
        .send_frame(&Frame::Method {
            id: denied_id,
            method: "whoami".into(),
            params: None,
            void: None,
        })
        .await
        .unwrap();
    match client.recv_frame().await.unwrap() {
        Frame::Error { id: Some(got), message, .. } => {
            assert_eq!(got, denied_id);
            assert_eq!(message, "Method Forbidden");
        }
        other => panic!("expected Error, got {:?}", other),
    }

    let login_id = RequestId::new();
    client
        .send_frame(&Frame::Method {
            id: login_id,
            method: "rpc:init".into(),
            params: Some(json!({"token": "a-valid-token"})),
            void: None,
        })
        .await
        .unwrap();
    match client.recv_frame().await.unwrap() {
        Frame::Result { id: got, .. } => assert_eq!(got, login_id),
        other => panic!("expected Result, got {:?}", other),
    }

    let allowed_id = RequestId::new();
    client
        .send_frame(&Frame::Method {
            id: allowed_id,
            method: "whoami".into(),
            params: None,
            void: None,
        })
        .await
        .unwrap();
    match client.recv_frame().await.unwrap() {
        Frame::Result { id: got, result, .. } => {
            assert_eq!(got, allowed_id);
            assert_eq!(result, json!("user-1"));
        }
        other => panic!("expected Result, got {:?}", other),
    }
}
