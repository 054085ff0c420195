//! Provider status, reachability, and cache endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::context::RequestContext;
use crate::providers::ProviderKind;

use super::routes::AppState;

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub(super) async fn list_providers(State(state): State<Arc<AppState>>) -> Response {
    Json(state.relay.statuses().await).into_response()
}

#[derive(Deserialize)]
pub(super) struct ProbeQuery {
    #[serde(default)]
    bypass: bool,
}

pub(super) async fn probe_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ProbeQuery>,
) -> Response {
    let Some(kind) = ProviderKind::from_id(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": format!("unknown provider: {id}")})),
        )
            .into_response();
    };

    let ctx = RequestContext::new();
    match state.relay.probe(&ctx, kind, query.bypass).await {
        Ok(()) => Json(json!({"provider": id, "reachable": true})).into_response(),
        Err(error) => Json(json!({
            "provider": id,
            "reachable": false,
            "error": error.to_string(),
        }))
        .into_response(),
    }
}

#[derive(Deserialize)]
pub(super) struct ClearQuery {
    provider: Option<String>,
}

pub(super) async fn cache_clear(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearQuery>,
) -> Response {
    match &query.provider {
        Some(id) => state.relay.connectivity().clear(id).await,
        None => state.relay.connectivity().clear_all().await,
    }
    Json(json!({"status": "ok"})).into_response()
}

pub(super) async fn cache_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.relay.connectivity().get_stats().await).into_response()
}
