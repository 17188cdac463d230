pub mod auth;
pub mod cors;
pub mod origin;
pub mod rate_limit;
