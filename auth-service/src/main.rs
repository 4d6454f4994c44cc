use std::sync::Arc;

use anyhow::Context;
use auth_service::app::cors_layer;
use auth_service::config::load_service_config;
use auth_service::repository::postgres::PgStore;
use auth_service::{build_router, AppState};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_service_config().context("Failed to load auth-service configuration")?;
    let addr = config.listen_addr();

    let state = match config.database_url.clone() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await
                .context("Failed to connect to DATABASE_URL")?;
            let store = PgStore::new(pool);
            AppState::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
                config,
            )?
        }
        None => {
            warn!("DATABASE_URL not set; accounts and sessions are kept in memory");
            AppState::in_memory(config)?.0
        }
    };

    let cors = cors_layer(&state.config);
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!(%addr, "starting auth-service");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
