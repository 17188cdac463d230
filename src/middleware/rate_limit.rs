use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::Error;
use crate::middleware::auth::Claims;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by caller identity (`Claims::sub`).
#[derive(Clone, Debug)]
pub struct RateLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    callers: Arc<Mutex<HashMap<String, WindowState>>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: u32, window: Duration) -> Self {
        Self {
            name,
            limit: limit.max(1),
            window,
            callers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn per_minute(name: &'static str, limit: u32) -> Self {
        Self::new(name, limit, Duration::from_secs(60))
    }

    pub fn allow(&self, caller: &str) -> bool {
        self.allow_at(caller, Instant::now())
    }

    fn allow_at(&self, caller: &str, now: Instant) -> bool {
        let mut callers = match self.callers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Keep the map bounded by dropping expired windows.
        if callers.len() > 10_000 {
            let window = self.window;
            callers.retain(|_, w| now.duration_since(w.start) < window);
        }
        let state = callers.entry(caller.to_string()).or_insert(WindowState {
            start: now,
            count: 0,
        });
        if now.duration_since(state.start) >= self.window {
            state.start = now;
            state.count = 0;
        }
        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

/// Must run after authentication so the caller's claims are present.
pub async fn per_caller_limit(
    State(limiter): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let caller = req
        .extensions()
        .get::<Claims>()
        .map(|c| c.sub.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    if !limiter.allow(&caller) {
        tracing::warn!(endpoint = limiter.name, caller = %caller, "Rate limit exceeded");
        return Error::RateLimited.into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_per_caller() {
        let limiter = RateLimiter::per_minute("start", 2);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn window_resets() {
        let limiter = RateLimiter::new("event", 1, Duration::from_millis(100));
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now + Duration::from_millis(50)));
        assert!(limiter.allow_at("a", now + Duration::from_millis(150)));
    }
}
