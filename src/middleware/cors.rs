use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// CORS restricted to the single configured assessment origin.
pub fn same_origin_cors(allowed_origin: &str) -> CorsLayer {
    let origin = match HeaderValue::from_str(allowed_origin.trim_end_matches('/')) {
        Ok(value) => AllowOrigin::exact(value),
        Err(_) => AllowOrigin::list(Vec::<HeaderValue>::new()),
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
