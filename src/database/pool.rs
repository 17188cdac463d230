use std::sync::Arc;

use sqlx::{postgres::PgPoolOptions, PgPool};

use super::event_log::{EventLog, PgEventLog};
use super::memory_store::{MemoryEventLog, MemorySessionStore};
use super::session_store::{PgSessionStore, SessionStore};
use crate::config::{Config, StoreBackend};
use crate::error::{Error, Result};

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventLog>,
    durable: bool,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            events: Arc::new(MemoryEventLog::new()),
            durable: false,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            events: Arc::new(PgEventLog::new(pool)),
            durable: true,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// Picks the store backend once at startup. The in-memory fallback is only
/// taken when explicitly enabled, which `Config::check` forbids in production.
pub async fn select_stores(config: &Config) -> Result<Stores> {
    match config.session_store {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory lockdown stores; sessions are lost on restart");
            Ok(Stores::in_memory())
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| Error::Config("DATABASE_URL is not set".to_string()))?;
            match connect_and_migrate(url).await {
                Ok(pool) => Ok(Stores::postgres(pool)),
                Err(e) if config.store_fallback => {
                    tracing::warn!(
                        error = %e,
                        "Postgres unreachable; STORE_FALLBACK enabled, using in-memory stores"
                    );
                    Ok(Stores::in_memory())
                }
                Err(e) => Err(e),
            }
        }
    }
}

async fn connect_and_migrate(url: &str) -> Result<PgPool> {
    let pool = create_pool(url).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;
    Ok(pool)
}
