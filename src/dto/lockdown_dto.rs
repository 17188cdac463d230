//! Wire types for the lockdown endpoints. The client runtime transport uses
//! the same structs, so both sides agree on field names and enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::environment::EnvironmentChecks;
use crate::models::lockdown_event::{LockdownEvent, LockdownEventType, Severity};
use crate::models::lockdown_session::{
    IntegrityCounters, LockdownResult, LockdownSession, Prompt, SessionStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[validate(length(min = 1, max = 64))]
    pub assessment_id: String,
    #[validate(length(min = 8, max = 128))]
    pub device_id: String,
    pub environment: EnvironmentChecks,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentInfo {
    pub id: String,
    pub name: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub duration_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    pub assessment: AssessmentInfo,
    pub started_at: DateTime<Utc>,
    pub policy_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    #[validate(length(min = 8, max = 128))]
    pub device_id: String,
    pub timer_remaining_sec: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub termination_reason: Option<String>,
    pub prompt: Prompt,
    pub integrity: IntegrityCounters,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub events_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    #[validate(length(min = 8, max = 128))]
    pub device_id: String,
    pub event_type: LockdownEventType,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub detail: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub status: SessionStatus,
    pub integrity: IntegrityCounters,
    pub termination_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FinishSubmission {
    pub typed_text: String,
    pub duration_sec: u32,
    #[serde(default)]
    pub backspace_count: u32,
    #[serde(default)]
    #[validate(length(max = 20000))]
    pub keystroke_intervals_ms: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    #[validate(length(min = 8, max = 128))]
    pub device_id: String,
    pub status: FinishStatus,
    #[validate(length(max = 500))]
    pub termination_reason: Option<String>,
    pub result: Option<FinishSubmission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Clear,
    NeedsReview,
    Flagged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishResponse {
    pub status: SessionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub review_status: ReviewStatus,
    pub events_count: usize,
    pub termination_reason: Option<String>,
    pub result: Option<LockdownResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventsResponse {
    pub session: LockdownSession,
    pub events: Vec<LockdownEvent>,
}
