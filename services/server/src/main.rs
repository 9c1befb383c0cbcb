use std::env;
use std::path::PathBuf;

use realtime_server::auth::{auth_fn, TokenStore};
use realtime_server::relay::RedisRelay;
use realtime_server::{build_router, config::ServerConfig, AppState};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "realtime-server.toml".to_owned());
    let config = ServerConfig::load(&PathBuf::from(config_path));

    let state = AppState::new(&config).await;

    let token_store = Arc::new(TokenStore::default());
    state.dispatcher.set_auth(auth_fn(token_store)).await;

    if let Some(redis_url) = &config.redis_url {
        info!(url = %redis_url, "connecting to cluster relay");
        match RedisRelay::connect(redis_url, state.instance_id.clone()).await {
            Ok(relay) => {
                let relay = Arc::new(relay);
                relay.spawn_receiver(state.dispatcher.clone());
                relay.spawn_presence_tracker(state.dispatcher.clone()).await;
                *state.presence_relay.write().await = Some(relay.clone());
                state.dispatcher.attach_relay(relay).await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to connect to cluster relay; running standalone");
            }
        }
    }

    let bind_addr = config.bind_addr.clone();
    let presence_relay = state.presence_relay.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    if let Some(relay) = presence_relay.read().await.clone() {
        relay.clear_presence().await;
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
