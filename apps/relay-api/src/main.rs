use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::auth::tokens::JwtKeys;
use relay_api::config::Config;
use relay_api::gateway::hub::Hub;
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file; env vars may also be set externally.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let hub_config = config.hub_config().expect("invalid hub configuration");

    tracing::info!(
        queue_capacity = hub_config.queue_capacity(),
        command_buffer = hub_config.command_buffer(),
        pong_wait = ?hub_config.liveness().pong_wait(),
        ping_period = ?hub_config.liveness().ping_period(),
        write_wait = ?hub_config.liveness().write_wait(),
        "relay-api configured"
    );

    let hub = Hub::spawn(hub_config);
    let keys = Arc::new(JwtKeys::from_secret(&config.jwt_secret));

    let state = AppState {
        hub: hub.clone(),
        keys,
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Close every session so clients see a going-away frame.
    if let Err(e) = hub.shutdown().await {
        tracing::warn!(%e, "hub already stopped");
    }
    tracing::info!("relay-api stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
