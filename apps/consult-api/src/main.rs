use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consult_api::config::Config;
use consult_api::db::kv::{KeyValueStore, MemoryStore};
use consult_api::directory::{PgSessionDirectory, SessionDirectory};
use consult_api::gateway::relay::SignalingRelay;
use consult_api::AppState;

#[tokio::main]
async fn main() {
    // Env vars may also be set externally; a missing .env is fine.
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

    let db = consult_api::db::pool::connect(&config.database_url, config.database_pool_size)
        .expect("failed to build connection pool");
    let directory: Arc<dyn SessionDirectory> = Arc::new(PgSessionDirectory::new(db));

    // Tickets are short-lived and single-process; an in-memory store is enough.
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let state = AppState {
        kv,
        config: Arc::new(config),
        relay: Arc::new(SignalingRelay::new(directory)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(consult_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "consult-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
