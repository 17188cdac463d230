pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::database::pool::Stores;
use crate::services::lockdown_service::LockdownService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store_backend: StoreBackend,
    pub lockdown: LockdownService,
}

impl AppState {
    pub fn new(config: Config, stores: Stores) -> Self {
        let store_backend = if stores.is_durable() {
            StoreBackend::Postgres
        } else {
            StoreBackend::Memory
        };
        let lockdown = LockdownService::new(stores, config.policy.clone());
        Self {
            config: Arc::new(config),
            store_backend,
            lockdown,
        }
    }
}
