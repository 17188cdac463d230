use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::services::prompt_service;
use crate::utils::token::generate_session_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntegrityCounters {
    pub focus_loss_count: u32,
    pub fullscreen_exit_count: u32,
    pub paste_attempts: u32,
    pub warnings_count: u32,
    pub multi_tab_detected: bool,
    pub suspicious_burst_detected: bool,
}

impl IntegrityCounters {
    /// Combines the stored counters with a proposed update so that no count
    /// goes down and no flag is cleared.
    pub fn merge_monotonic(&self, proposed: &IntegrityCounters) -> IntegrityCounters {
        IntegrityCounters {
            focus_loss_count: self.focus_loss_count.max(proposed.focus_loss_count),
            fullscreen_exit_count: self.fullscreen_exit_count.max(proposed.fullscreen_exit_count),
            paste_attempts: self.paste_attempts.max(proposed.paste_attempts),
            warnings_count: self.warnings_count.max(proposed.warnings_count),
            multi_tab_detected: self.multi_tab_detected || proposed.multi_tab_detected,
            suspicious_burst_detected: self.suspicious_burst_detected
                || proposed.suspicious_burst_detected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeCadence {
    pub keystrokes: u32,
    pub mean_interval_ms: f64,
    pub stddev_interval_ms: f64,
    pub min_interval_ms: f64,
    pub max_interval_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingScore {
    pub gross_wpm: f64,
    pub net_wpm: f64,
    pub accuracy: f64,
    pub typed_characters: u32,
    pub correct_characters: u32,
    pub mismatches: u32,
    pub extra_characters: u32,
    pub missing_characters: u32,
    pub total_errors: u32,
    pub backspace_count: u32,
    pub duration_sec: u32,
    pub cadence: KeystrokeCadence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockdownResult {
    pub typing: TypingScore,
    pub integrity: IntegrityCounters,
    pub integrity_score: u8,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockdownSession {
    pub session_id: String,
    pub candidate_user_id: String,
    pub assessment_id: String,
    pub assessment_name: String,
    pub device_id: String,
    pub prompt: Prompt,
    pub status: SessionStatus,
    pub termination_reason: Option<String>,
    pub integrity: IntegrityCounters,
    pub result: Option<LockdownResult>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LockdownSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub candidate_user_id: String,
    pub assessment_id: String,
    pub assessment_name: String,
    pub device_id: String,
}

impl NewSession {
    pub fn into_session(self, now: DateTime<Utc>) -> LockdownSession {
        LockdownSession {
            session_id: generate_session_id(),
            candidate_user_id: self.candidate_user_id,
            assessment_id: self.assessment_id,
            assessment_name: self.assessment_name,
            device_id: self.device_id,
            prompt: prompt_service::select_prompt(now),
            status: SessionStatus::Active,
            termination_reason: None,
            integrity: IntegrityCounters::default(),
            result: None,
            started_at: now,
            last_heartbeat_at: now,
            completed_at: None,
        }
    }
}
