use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Error, Result};
use crate::models::lockdown_session::{
    IntegrityCounters, LockdownResult, LockdownSession, NewSession, Prompt, TypingScore,
};
use crate::services::integrity_service;

pub type IntegrityMutation<'a> = &'a (dyn Fn(&mut IntegrityCounters) + Send + Sync);

/// Authoritative storage for lockdown sessions.
///
/// Every method is one state transition. Terminal transitions are only valid
/// from `active`; calling them on a completed or terminated session returns
/// `Error::Conflict` and leaves the stored record untouched.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<LockdownSession>;

    async fn get_session_by_id(&self, id: &str) -> Result<Option<LockdownSession>>;

    async fn touch_session(&self, id: &str) -> Result<LockdownSession>;

    /// Load, mutate and store the counters as one atomic step per session.
    /// The stored result is merged monotonically with the previous counters.
    async fn update_integrity_counters(
        &self,
        id: &str,
        mutate: IntegrityMutation<'_>,
    ) -> Result<LockdownSession>;

    async fn terminate_session(&self, id: &str, reason: &str) -> Result<LockdownSession>;

    /// Completes the session. The integrity counters and score in the stored
    /// result are taken from the record in the same atomic step, so they always
    /// match the session's final counters.
    async fn complete_session(&self, id: &str, typing: TypingScore) -> Result<LockdownSession>;

    async fn list_active_sessions(&self) -> Result<Vec<LockdownSession>>;
}

pub(crate) fn transition_conflict(session: &LockdownSession) -> Error {
    match &session.termination_reason {
        Some(reason) => Error::Conflict(format!(
            "Session is no longer active ({}): {}",
            session.status, reason
        )),
        None => Error::Conflict(format!("Session is no longer active ({})", session.status)),
    }
}

pub(crate) fn session_not_found(id: &str) -> Error {
    Error::NotFound(format!("Lockdown session {} not found", id))
}

#[derive(Debug, FromRow)]
struct LockdownSessionRow {
    id: String,
    candidate_user_id: String,
    assessment_id: String,
    assessment_name: String,
    device_id: String,
    prompt_id: String,
    prompt_text: String,
    status: String,
    termination_reason: Option<String>,
    integrity: Json<IntegrityCounters>,
    result: Option<Json<LockdownResult>>,
    started_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<LockdownSessionRow> for LockdownSession {
    type Error = Error;

    fn try_from(row: LockdownSessionRow) -> Result<Self> {
        Ok(LockdownSession {
            status: row.status.parse().map_err(Error::Internal)?,
            session_id: row.id,
            candidate_user_id: row.candidate_user_id,
            assessment_id: row.assessment_id,
            assessment_name: row.assessment_name,
            device_id: row.device_id,
            prompt: Prompt {
                id: row.prompt_id,
                text: row.prompt_text,
            },
            termination_reason: row.termination_reason,
            integrity: row.integrity.0,
            result: row.result.map(|r| r.0),
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conflict_or_missing(&self, id: &str) -> Error {
        match self.get_session_by_id(id).await {
            Ok(Some(session)) => transition_conflict(&session),
            Ok(None) => session_not_found(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, new: NewSession) -> Result<LockdownSession> {
        let session = new.into_session(Utc::now());
        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"
            INSERT INTO lockdown_sessions (
                id, candidate_user_id, assessment_id, assessment_name, device_id,
                prompt_id, prompt_text, status, termination_reason, integrity, result,
                started_at, last_heartbeat_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', NULL, $8, NULL, $9, $9, NULL)
            RETURNING *
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.candidate_user_id)
        .bind(&session.assessment_id)
        .bind(&session.assessment_name)
        .bind(&session.device_id)
        .bind(&session.prompt.id)
        .bind(&session.prompt.text)
        .bind(Json(&session.integrity))
        .bind(session.started_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_session_by_id(&self, id: &str) -> Result<Option<LockdownSession>> {
        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"SELECT * FROM lockdown_sessions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LockdownSession::try_from).transpose()
    }

    async fn touch_session(&self, id: &str) -> Result<LockdownSession> {
        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"UPDATE lockdown_sessions SET last_heartbeat_at = $2 WHERE id = $1 RETURNING *"#,
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| session_not_found(id))?.try_into()
    }

    async fn update_integrity_counters(
        &self,
        id: &str,
        mutate: IntegrityMutation<'_>,
    ) -> Result<LockdownSession> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, LockdownSessionRow>(
            r#"SELECT * FROM lockdown_sessions WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| session_not_found(id))?;
        let current = LockdownSession::try_from(current)?;
        if !current.is_active() {
            return Err(transition_conflict(&current));
        }

        let mut proposed = current.integrity.clone();
        mutate(&mut proposed);
        let merged = current.integrity.merge_monotonic(&proposed);

        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"UPDATE lockdown_sessions SET integrity = $2 WHERE id = $1 RETURNING *"#,
        )
        .bind(id)
        .bind(Json(&merged))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn terminate_session(&self, id: &str, reason: &str) -> Result<LockdownSession> {
        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"
            UPDATE lockdown_sessions
            SET status = 'terminated', termination_reason = $2, completed_at = $3
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.conflict_or_missing(id).await),
        }
    }

    async fn complete_session(&self, id: &str, typing: TypingScore) -> Result<LockdownSession> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, LockdownSessionRow>(
            r#"SELECT * FROM lockdown_sessions WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| session_not_found(id))?;
        let current = LockdownSession::try_from(current)?;
        if !current.is_active() {
            return Err(transition_conflict(&current));
        }

        let now = Utc::now();
        let result = integrity_service::final_result(typing, &current.integrity, now);
        let row = sqlx::query_as::<_, LockdownSessionRow>(
            r#"
            UPDATE lockdown_sessions
            SET status = 'completed', result = $2, completed_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(&result))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn list_active_sessions(&self) -> Result<Vec<LockdownSession>> {
        let rows = sqlx::query_as::<_, LockdownSessionRow>(
            r#"SELECT * FROM lockdown_sessions WHERE status = 'active' ORDER BY started_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LockdownSession::try_from).collect()
    }
}
