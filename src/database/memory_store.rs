//! In-process stores for development and tests. Selected explicitly at
//! startup; production configuration refuses them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::event_log::EventLog;
use super::session_store::{
    session_not_found, transition_conflict, IntegrityMutation, SessionStore,
};
use crate::error::{Error, Result};
use crate::models::lockdown_event::{LockdownEvent, MAX_EVENTS_PER_SESSION};
use crate::models::lockdown_session::{LockdownSession, NewSession, SessionStatus, TypingScore};
use crate::services::integrity_service;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Internal("in-memory store lock poisoned".to_string()))
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, LockdownSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `apply` against an active session while holding the map lock.
    fn with_active<F>(&self, id: &str, apply: F) -> Result<LockdownSession>
    where
        F: FnOnce(&mut LockdownSession),
    {
        let mut sessions = lock(&self.sessions)?;
        let session = sessions.get_mut(id).ok_or_else(|| session_not_found(id))?;
        if !session.is_active() {
            return Err(transition_conflict(session));
        }
        apply(session);
        Ok(session.clone())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, new: NewSession) -> Result<LockdownSession> {
        let session = new.into_session(Utc::now());
        lock(&self.sessions)?.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session_by_id(&self, id: &str) -> Result<Option<LockdownSession>> {
        Ok(lock(&self.sessions)?.get(id).cloned())
    }

    async fn touch_session(&self, id: &str) -> Result<LockdownSession> {
        let mut sessions = lock(&self.sessions)?;
        let session = sessions.get_mut(id).ok_or_else(|| session_not_found(id))?;
        session.last_heartbeat_at = Utc::now();
        Ok(session.clone())
    }

    async fn update_integrity_counters(
        &self,
        id: &str,
        mutate: IntegrityMutation<'_>,
    ) -> Result<LockdownSession> {
        self.with_active(id, |session| {
            let mut proposed = session.integrity.clone();
            mutate(&mut proposed);
            session.integrity = session.integrity.merge_monotonic(&proposed);
        })
    }

    async fn terminate_session(&self, id: &str, reason: &str) -> Result<LockdownSession> {
        self.with_active(id, |session| {
            session.status = SessionStatus::Terminated;
            session.termination_reason = Some(reason.to_string());
            session.completed_at = Some(Utc::now());
        })
    }

    async fn complete_session(&self, id: &str, typing: TypingScore) -> Result<LockdownSession> {
        self.with_active(id, |session| {
            let now = Utc::now();
            session.result = Some(integrity_service::final_result(typing, &session.integrity, now));
            session.status = SessionStatus::Completed;
            session.completed_at = Some(now);
        })
    }

    async fn list_active_sessions(&self) -> Result<Vec<LockdownSession>> {
        let mut active: Vec<LockdownSession> = lock(&self.sessions)?
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.started_at);
        Ok(active)
    }
}

#[derive(Clone, Default)]
pub struct MemoryEventLog {
    events: Arc<Mutex<HashMap<String, VecDeque<LockdownEvent>>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: LockdownEvent) -> Result<LockdownEvent> {
        let mut events = lock(&self.events)?;
        let log = events.entry(event.session_id.clone()).or_default();
        // Writers may arrive out of order; keep the deque sorted by timestamp.
        let pos = log.partition_point(|e| e.at <= event.at);
        log.insert(pos, event.clone());
        while log.len() > MAX_EVENTS_PER_SESSION {
            log.pop_front();
        }
        Ok(event)
    }

    async fn get_events(&self, session_id: &str) -> Result<Vec<LockdownEvent>> {
        Ok(lock(&self.events)?
            .get(session_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_events(&self, session_id: &str) -> Result<usize> {
        Ok(lock(&self.events)?
            .get(session_id)
            .map(|log| log.len())
            .unwrap_or(0))
    }
}
