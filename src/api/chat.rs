//! Chat completion endpoint: unary JSON or SSE streaming.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;

use crate::broker::RelayError;
use crate::context::RequestContext;
use crate::error::AuthError;
use crate::types::ChatRequest;

use super::routes::AppState;

/// Error body in the shape API clients already parse.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

pub(super) fn relay_error_response(error: RelayError) -> Response {
    let (status, kind) = match &error {
        RelayError::UnknownProvider(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        RelayError::Auth(auth) => match auth {
            AuthError::NoAuthConfigured | AuthError::NoCredentialsConfigured => {
                (StatusCode::UNAUTHORIZED, "authentication_error")
            }
            AuthError::AllUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
            }
            AuthError::AllAttemptsFailed { source, .. } => (
                source
                    .status_code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_error",
            ),
            AuthError::RefreshFailed { .. } => (StatusCode::BAD_GATEWAY, "refresh_error"),
        },
    };
    let body = ErrorResponse {
        error: ErrorBody {
            message: error.to_string(),
            r#type: kind,
            code: None,
        },
    };
    (status, Json(body)).into_response()
}

pub(super) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let ctx = RequestContext::new();

    if request.stream {
        let stream = match state.relay.chat_stream(&ctx, &request).await {
            Ok(stream) => stream,
            Err(error) => return relay_error_response(error),
        };
        let events = stream.map(|item| -> Result<Event, Infallible> {
            let event = match item {
                Ok(event) => Event::default()
                    .json_data(&event)
                    .unwrap_or_else(|_| Event::default().data("{}")),
                Err(error) => Event::default()
                    .event("error")
                    .json_data(&serde_json::json!({"message": error.to_string()}))
                    .unwrap_or_else(|_| Event::default().event("error").data("{}")),
            };
            Ok(event)
        });
        return Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    }

    match state.relay.chat(&ctx, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => relay_error_response(error),
    }
}
