//! Client-side key/value storage. `Session` is per-tab and short-lived,
//! `Shared` is visible to every tab of the same origin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const ACTIVE_LOCK_KEY: &str = "lockdown.activeLock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageArea {
    Session,
    Shared,
}

pub trait ClientStorage: Send + Sync {
    fn get(&self, area: StorageArea, key: &str) -> Option<String>;

    /// Returns false when the area refuses writes (quota, private mode).
    fn set(&self, area: StorageArea, key: &str, value: &str) -> bool;

    fn remove(&self, area: StorageArea, key: &str);
}

pub fn read_json<T: DeserializeOwned>(
    storage: &dyn ClientStorage,
    area: StorageArea,
    key: &str,
) -> Option<T> {
    let raw = storage.get(area, key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key, error = %e, "Discarding unreadable client storage entry");
            None
        }
    }
}

pub fn write_json<T: Serialize>(
    storage: &dyn ClientStorage,
    area: StorageArea,
    key: &str,
    value: &T,
) -> bool {
    match serde_json::to_string(value) {
        Ok(raw) => storage.set(area, key, &raw),
        Err(_) => false,
    }
}

/// Record a tab writes to shared storage while it runs a secure session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveLock {
    pub session_id: String,
    pub assessment_id: String,
    pub at: DateTime<Utc>,
}

impl ActiveLock {
    pub fn read(storage: &dyn ClientStorage) -> Option<Self> {
        read_json(storage, StorageArea::Shared, ACTIVE_LOCK_KEY)
    }

    pub fn write(&self, storage: &dyn ClientStorage) -> bool {
        write_json(storage, StorageArea::Shared, ACTIVE_LOCK_KEY, self)
    }

    /// Removes the shared lock only if it still belongs to `session_id`.
    pub fn release(storage: &dyn ClientStorage, session_id: &str) {
        if let Some(lock) = Self::read(storage) {
            if lock.session_id == session_id {
                storage.remove(StorageArea::Shared, ACTIVE_LOCK_KEY);
            }
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Default)]
struct Areas {
    session: HashMap<String, String>,
    shared: HashMap<String, String>,
}

impl Areas {
    fn area(&mut self, area: StorageArea) -> &mut HashMap<String, String> {
        match area {
            StorageArea::Session => &mut self.session,
            StorageArea::Shared => &mut self.shared,
        }
    }
}

/// In-process storage. Clones share the same maps, which models two tabs of
/// one origin when they also share the `Shared` area.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Areas>>,
    shared_writable: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            shared_writable: true,
        }
    }

    /// Storage whose shared area rejects writes, as in some private modes.
    pub fn without_shared_writes() -> Self {
        Self {
            inner: Arc::default(),
            shared_writable: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Areas> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStorage for MemoryStorage {
    fn get(&self, area: StorageArea, key: &str) -> Option<String> {
        self.lock().area(area).get(key).cloned()
    }

    fn set(&self, area: StorageArea, key: &str, value: &str) -> bool {
        if area == StorageArea::Shared && !self.shared_writable {
            return false;
        }
        self.lock().area(area).insert(key.to_string(), value.to_string());
        true
    }

    fn remove(&self, area: StorageArea, key: &str) {
        self.lock().area(area).remove(key);
    }
}
