pub mod auth;
pub mod config;
pub mod relay;
pub mod state;
pub mod transport;

pub use state::AppState;

use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::http::StatusCode;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(transport::HTTP_PATH, get(transport::sse::handle).post(transport::http::handle))
        .route(transport::WS_PATH, get(transport::ws::upgrade))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/__h/presence", get(health::presence))
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback_404() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

mod health {
    use axum::extract::State;
    use axum::response::IntoResponse;

    use crate::state::AppState;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
        if state.dispatcher.accepting_connections() {
            "ok"
        } else {
            "draining"
        }
    }

    /// Cluster-wide connection and distinct-authenticated-user counts when
    /// a relay is attached; this instance's own counts standalone.
    pub async fn presence(State(state): State<AppState>) -> impl IntoResponse {
        let relay = state.presence_relay.read().await.clone();
        match relay {
            Some(relay) => axum::Json(relay.cluster_presence().await),
            None => axum::Json(state.dispatcher.presence().await),
        }
    }
}

// keep the shared helper discoverable alongside the routes it guards
pub use transport::is_reserved_backend_path;
