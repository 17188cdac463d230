use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Extension, Json,
};

use crate::dto::lockdown_dto::{
    EventRequest, EventResponse, FinishRequest, FinishResponse, HeartbeatRequest,
    HeartbeatResponse, SessionEventsResponse, StartRequest, StartResponse,
};
use crate::error::{Error, Result};
use crate::middleware::auth::Claims;
use crate::AppState;

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::BadRequest(rejection.body_text()))
}

pub async fn start(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: std::result::Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>> {
    let req = body(payload)?;
    Ok(Json(state.lockdown.start(&claims.sub, req).await?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatResponse>> {
    let req = body(payload)?;
    Ok(Json(state.lockdown.heartbeat(&claims.sub, req).await?))
}

pub async fn record_event(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: std::result::Result<Json<EventRequest>, JsonRejection>,
) -> Result<Json<EventResponse>> {
    let req = body(payload)?;
    Ok(Json(state.lockdown.record_event(&claims.sub, req).await?))
}

pub async fn finish(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: std::result::Result<Json<FinishRequest>, JsonRejection>,
) -> Result<Json<FinishResponse>> {
    let req = body(payload)?;
    Ok(Json(state.lockdown.finish(&claims.sub, req).await?))
}

pub async fn session_events(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionEventsResponse>> {
    tracing::info!(reviewer = %claims.sub, session_id = %session_id, "Session replay requested");
    Ok(Json(state.lockdown.session_events(&session_id).await?))
}
