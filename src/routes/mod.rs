pub mod health;
pub mod lockdown;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post, MethodRouter},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::middleware::{
    auth::{require_candidate, require_reviewer},
    cors::same_origin_cors,
    origin::require_same_origin,
    rate_limit::{per_caller_limit, RateLimiter},
};
use crate::AppState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

fn limited(route: MethodRouter<AppState>, limiter: RateLimiter) -> MethodRouter<AppState> {
    route.layer(from_fn_with_state(limiter, per_caller_limit))
}

pub fn build_router(state: AppState) -> Router {
    let limits = &state.config.rate_limits;

    let lockdown_api = Router::new()
        .route(
            "/api/lockdown/start",
            limited(
                post(lockdown::start),
                RateLimiter::per_minute("start", limits.start_per_minute),
            ),
        )
        .route(
            "/api/lockdown/heartbeat",
            limited(
                post(lockdown::heartbeat),
                RateLimiter::per_minute("heartbeat", limits.heartbeat_per_minute),
            ),
        )
        .route(
            "/api/lockdown/event",
            limited(
                post(lockdown::record_event),
                RateLimiter::per_minute("event", limits.event_per_minute),
            ),
        )
        .route(
            "/api/lockdown/finish",
            limited(
                post(lockdown::finish),
                RateLimiter::per_minute("finish", limits.finish_per_minute),
            ),
        )
        .route_layer(from_fn_with_state(state.clone(), require_candidate))
        .route_layer(from_fn_with_state(state.clone(), require_same_origin));

    let review_api = Router::new()
        .route(
            "/api/lockdown/sessions/:id/events",
            get(lockdown::session_events),
        )
        .route_layer(from_fn_with_state(state.clone(), require_reviewer));

    let cors = same_origin_cors(&state.config.allowed_origin);

    Router::new()
        .route("/health", get(health::health))
        .merge(lockdown_api)
        .merge(review_api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
