use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::lockdown_event::{
    LockdownEvent, LockdownEventType, Severity, MAX_EVENTS_PER_SESSION,
};

/// Append-only per-session audit log, retaining the newest
/// `MAX_EVENTS_PER_SESSION` entries. Reads are always oldest-first.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: LockdownEvent) -> Result<LockdownEvent>;

    async fn get_events(&self, session_id: &str) -> Result<Vec<LockdownEvent>>;

    async fn count_events(&self, session_id: &str) -> Result<usize>;

    async fn append_event(
        &self,
        session_id: &str,
        event_type: LockdownEventType,
        detail: &str,
        severity: Severity,
    ) -> Result<LockdownEvent> {
        self.append(LockdownEvent {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            at: Utc::now(),
            event_type,
            detail: detail.to_string(),
            severity,
        })
        .await
    }
}

#[derive(Debug, FromRow)]
struct LockdownEventRow {
    id: Uuid,
    session_id: String,
    at: DateTime<Utc>,
    event_type: String,
    detail: String,
    severity: String,
}

impl TryFrom<LockdownEventRow> for LockdownEvent {
    type Error = Error;

    fn try_from(row: LockdownEventRow) -> Result<Self> {
        Ok(LockdownEvent {
            id: row.id,
            session_id: row.session_id,
            at: row.at,
            event_type: row.event_type.parse().map_err(Error::Internal)?,
            detail: row.detail,
            severity: row.severity.parse().map_err(Error::Internal)?,
        })
    }
}

#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, event: LockdownEvent) -> Result<LockdownEvent> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, LockdownEventRow>(
            r#"
            INSERT INTO lockdown_events (id, session_id, at, event_type, detail, severity)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, session_id, at, event_type, detail, severity
            "#,
        )
        .bind(event.id)
        .bind(&event.session_id)
        .bind(event.at)
        .bind(event.event_type.as_str())
        .bind(&event.detail)
        .bind(event.severity.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM lockdown_events
            WHERE id IN (
                SELECT id FROM lockdown_events
                WHERE session_id = $1
                ORDER BY at DESC, seq DESC
                OFFSET $2
            )
            "#,
        )
        .bind(&event.session_id)
        .bind(MAX_EVENTS_PER_SESSION as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn get_events(&self, session_id: &str) -> Result<Vec<LockdownEvent>> {
        let rows = sqlx::query_as::<_, LockdownEventRow>(
            r#"
            SELECT id, session_id, at, event_type, detail, severity FROM (
                SELECT id, session_id, at, event_type, detail, severity, seq
                FROM lockdown_events
                WHERE session_id = $1
                ORDER BY at DESC, seq DESC
                LIMIT $2
            ) recent
            ORDER BY at ASC, seq ASC
            "#,
        )
        .bind(session_id)
        .bind(MAX_EVENTS_PER_SESSION as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LockdownEvent::try_from).collect()
    }

    async fn count_events(&self, session_id: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM lockdown_events WHERE session_id = $1"#)
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((count.max(0) as usize).min(MAX_EVENTS_PER_SESSION))
    }
}
