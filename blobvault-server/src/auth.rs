//! Shared-secret gate applied to every route except `/healthz`: the caller
//! must present the configured key via the `X-API-Key` header or the
//! `api_key` query parameter.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

fn extract_key(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(value) = headers.get("X-API-Key") {
        if let Ok(value) = value.to_str() {
            return Some(value.to_string());
        }
    }
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("api_key=") {
            return Some(value.to_string());
        }
    }
    None
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let query = request.uri().query().unwrap_or("");
    let presented = extract_key(request.headers(), query);

    match presented {
        Some(key) if key == state.config.middleware_key => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({ "code": 401, "status": "UNAUTHORIZED" })),
        )
            .into_response(),
    }
}
