//! HTTP route table and server entry point.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broker::Relay;
use crate::config::Config;

use super::{chat, status};

/// Shared application state.
pub struct AppState {
    pub relay: Relay,
}

/// Build the route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/api/providers", get(status::list_providers))
        .route("/api/providers/:id/health", get(status::probe_provider))
        .route("/api/cache/stats", get(status::cache_stats))
        .route("/api/cache/clear", post(status::cache_clear))
        .route("/api/health", get(status::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let relay = Relay::from_config(&config)?;
    let state = Arc::new(AppState { relay });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
