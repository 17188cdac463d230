use axum::{
    extract::{Request, State},
    http::{header::ORIGIN, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::AppState;

/// State-changing requests must carry an `Origin` equal to the configured one.
pub async fn require_same_origin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::POST {
        let origin = req.headers().get(ORIGIN).and_then(|v| v.to_str().ok());
        if !origin_allowed(origin, &state.config.allowed_origin) {
            tracing::warn!(origin = ?origin, path = %req.uri().path(), "Cross-origin POST rejected");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"error":"origin_not_allowed"})),
            )
                .into_response();
        }
    }
    next.run(req).await
}

pub fn origin_allowed(origin: Option<&str>, allowed: &str) -> bool {
    match origin {
        Some(origin) => origin.trim_end_matches('/') == allowed.trim_end_matches('/'),
        None => false,
    }
}
