use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Events retained per session; older entries are dropped first.
pub const MAX_EVENTS_PER_SESSION: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockdownEventType {
    SessionStarted,
    Heartbeat,
    FocusLost,
    FocusRegained,
    FullscreenEntered,
    FullscreenExited,
    FullscreenDenied,
    PasteAttempt,
    CopyAttempt,
    CutAttempt,
    KeyboardAnomaly,
    MultiTabDetected,
    SuspiciousInputBurst,
    AutomationFlagged,
    Submitted,
    SessionCompleted,
    SessionTerminated,
}

impl LockdownEventType {
    pub const ALL: [LockdownEventType; 17] = [
        LockdownEventType::SessionStarted,
        LockdownEventType::Heartbeat,
        LockdownEventType::FocusLost,
        LockdownEventType::FocusRegained,
        LockdownEventType::FullscreenEntered,
        LockdownEventType::FullscreenExited,
        LockdownEventType::FullscreenDenied,
        LockdownEventType::PasteAttempt,
        LockdownEventType::CopyAttempt,
        LockdownEventType::CutAttempt,
        LockdownEventType::KeyboardAnomaly,
        LockdownEventType::MultiTabDetected,
        LockdownEventType::SuspiciousInputBurst,
        LockdownEventType::AutomationFlagged,
        LockdownEventType::Submitted,
        LockdownEventType::SessionCompleted,
        LockdownEventType::SessionTerminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockdownEventType::SessionStarted => "session_started",
            LockdownEventType::Heartbeat => "heartbeat",
            LockdownEventType::FocusLost => "focus_lost",
            LockdownEventType::FocusRegained => "focus_regained",
            LockdownEventType::FullscreenEntered => "fullscreen_entered",
            LockdownEventType::FullscreenExited => "fullscreen_exited",
            LockdownEventType::FullscreenDenied => "fullscreen_denied",
            LockdownEventType::PasteAttempt => "paste_attempt",
            LockdownEventType::CopyAttempt => "copy_attempt",
            LockdownEventType::CutAttempt => "cut_attempt",
            LockdownEventType::KeyboardAnomaly => "keyboard_anomaly",
            LockdownEventType::MultiTabDetected => "multi_tab_detected",
            LockdownEventType::SuspiciousInputBurst => "suspicious_input_burst",
            LockdownEventType::AutomationFlagged => "automation_flagged",
            LockdownEventType::Submitted => "submitted",
            LockdownEventType::SessionCompleted => "session_completed",
            LockdownEventType::SessionTerminated => "session_terminated",
        }
    }

    /// Lifecycle events are written by the server only.
    pub fn is_client_reportable(&self) -> bool {
        !matches!(
            self,
            LockdownEventType::SessionStarted
                | LockdownEventType::Heartbeat
                | LockdownEventType::Submitted
                | LockdownEventType::SessionCompleted
                | LockdownEventType::SessionTerminated
        )
    }

    /// Events that count against the candidate's visible warning tally.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            LockdownEventType::FocusLost
                | LockdownEventType::FullscreenExited
                | LockdownEventType::FullscreenDenied
                | LockdownEventType::PasteAttempt
                | LockdownEventType::CopyAttempt
                | LockdownEventType::CutAttempt
                | LockdownEventType::KeyboardAnomaly
                | LockdownEventType::MultiTabDetected
                | LockdownEventType::SuspiciousInputBurst
                | LockdownEventType::AutomationFlagged
        )
    }

    pub fn minimum_severity(&self) -> Severity {
        match self {
            LockdownEventType::MultiTabDetected | LockdownEventType::SessionTerminated => {
                Severity::Critical
            }
            t if t.is_violation() => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for LockdownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockdownEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LockdownEventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockdownEvent {
    pub id: Uuid,
    pub session_id: String,
    pub at: DateTime<Utc>,
    pub event_type: LockdownEventType,
    pub detail: String,
    pub severity: Severity,
}
