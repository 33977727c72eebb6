mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;
mod store;

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "boardrelay=info,tower_http=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .init();

    let config = config::RelayConfig::from_env().expect("invalid relay configuration");
    let store = store::connect(&config.store).await.expect("snapshot store init failed");
    tracing::info!(
        store = config.store.kind(),
        grace_ms = config.grace_period.as_millis(),
        autosave_ms = config.autosave_debounce.as_millis(),
        policy = ?config.mutation_policy,
        hydrate_on_join = config.hydrate_on_join,
        "relay configured"
    );

    let port = config.port;
    let state = state::AppState::new(config, store);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "boardrelay listening");
    axum::serve(listener, app).await.expect("server failed");
}
