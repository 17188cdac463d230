use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Thresholds and timing windows applied by the server to every session.
#[derive(Debug, Clone)]
pub struct LockdownPolicy {
    pub max_focus_loss: u32,
    pub max_fullscreen_exit: u32,
    pub heartbeat_timeout_sec: i64,
    pub overrun_grace_sec: i64,
}

impl Default for LockdownPolicy {
    fn default() -> Self {
        Self {
            max_focus_loss: 3,
            max_fullscreen_exit: 2,
            heartbeat_timeout_sec: 45,
            overrun_grace_sec: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub start_per_minute: u32,
    pub heartbeat_per_minute: u32,
    pub event_per_minute: u32,
    pub finish_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            start_per_minute: 6,
            heartbeat_per_minute: 30,
            event_per_minute: 120,
            finish_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub app_env: AppEnv,
    pub session_store: StoreBackend,
    pub database_url: Option<String>,
    pub store_fallback: bool,
    pub jwt_secret: String,
    pub allowed_origin: String,
    pub rate_limits: RateLimits,
    pub policy: LockdownPolicy,
    pub sweep_interval_sec: u64,
    pub json_logs: bool,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let app_env = match get_env_or("APP_ENV", "development").to_lowercase().as_str() {
            "production" | "prod" => AppEnv::Production,
            "development" | "dev" | "test" => AppEnv::Development,
            other => return Err(Error::Config(format!("Invalid value for APP_ENV: {}", other))),
        };
        let session_store = match get_env_or("SESSION_STORE", "postgres").to_lowercase().as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(Error::Config(format!(
                    "Invalid value for SESSION_STORE: {}",
                    other
                )))
            }
        };
        let database_url = env::var("DATABASE_URL").ok();
        if session_store == StoreBackend::Postgres && database_url.is_none() {
            return Err(Error::Config(
                "Missing environment variable: DATABASE_URL".to_string(),
            ));
        }

        let config = Self {
            server_address: get_env("SERVER_ADDRESS")?,
            app_env,
            session_store,
            database_url,
            store_fallback: get_env_parse_or("STORE_FALLBACK", false)?,
            jwt_secret: get_env("JWT_SECRET")?,
            allowed_origin: get_env("ALLOWED_ORIGIN")?,
            rate_limits: RateLimits {
                start_per_minute: get_env_parse_or("START_LIMIT_PER_MINUTE", 6)?,
                heartbeat_per_minute: get_env_parse_or("HEARTBEAT_LIMIT_PER_MINUTE", 30)?,
                event_per_minute: get_env_parse_or("EVENT_LIMIT_PER_MINUTE", 120)?,
                finish_per_minute: get_env_parse_or("FINISH_LIMIT_PER_MINUTE", 10)?,
            },
            policy: LockdownPolicy {
                max_focus_loss: get_env_parse_or("MAX_FOCUS_LOSS", 3)?,
                max_fullscreen_exit: get_env_parse_or("MAX_FULLSCREEN_EXIT", 2)?,
                heartbeat_timeout_sec: get_env_parse_or("HEARTBEAT_TIMEOUT_SEC", 45)?,
                overrun_grace_sec: get_env_parse_or("OVERRUN_GRACE_SEC", 15)?,
            },
            sweep_interval_sec: get_env_parse_or("SWEEP_INTERVAL_SEC", 15)?,
            json_logs: get_env_or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
        };
        config.check()?;
        Ok(config)
    }

    /// Rejects combinations that would let a production deployment lose data silently.
    pub fn check(&self) -> Result<()> {
        if self.app_env == AppEnv::Production {
            if self.session_store == StoreBackend::Memory {
                return Err(Error::Config(
                    "SESSION_STORE=memory is not allowed when APP_ENV=production".to_string(),
                ));
            }
            if self.store_fallback {
                return Err(Error::Config(
                    "STORE_FALLBACK is not allowed when APP_ENV=production".to_string(),
                ));
            }
        }
        if self.policy.max_focus_loss == 0 || self.policy.max_fullscreen_exit == 0 {
            return Err(Error::Config(
                "Focus-loss and fullscreen-exit thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_env_parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> Result<&'static Config> {
    CONFIG
        .get()
        .ok_or_else(|| Error::Config("Configuration has not been initialized".to_string()))
}
