use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::config::StoreBackend;
use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store_backend {
        StoreBackend::Postgres => "postgres",
        StoreBackend::Memory => "memory",
    };
    let body = json!({
        "status": "ok",
        "store": store,
    });
    (StatusCode::OK, Json(body))
}
