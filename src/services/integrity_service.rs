use chrono::{DateTime, Utc};

use crate::config::LockdownPolicy;
use crate::models::lockdown_event::LockdownEventType;
use crate::models::lockdown_session::{IntegrityCounters, LockdownResult, TypingScore};

pub const FOCUS_LOSS_PENALTY: i64 = 10;
pub const FULLSCREEN_EXIT_PENALTY: i64 = 14;
pub const PASTE_PENALTY: i64 = 12;
pub const MULTI_TAB_PENALTY: i64 = 40;
pub const SUSPICIOUS_BURST_PENALTY: i64 = 12;

/// 0-100 integrity score from accumulated counters.
pub fn integrity_score(counters: &IntegrityCounters) -> u8 {
    let penalty = FOCUS_LOSS_PENALTY * counters.focus_loss_count as i64
        + FULLSCREEN_EXIT_PENALTY * counters.fullscreen_exit_count as i64
        + PASTE_PENALTY * counters.paste_attempts as i64
        + MULTI_TAB_PENALTY * counters.multi_tab_detected as i64
        + SUSPICIOUS_BURST_PENALTY * counters.suspicious_burst_detected as i64;
    (100 - penalty).clamp(0, 100) as u8
}

/// Final result for a completed session: the typing score plus a snapshot of
/// the counters it was scored against.
pub fn final_result(
    typing: TypingScore,
    counters: &IntegrityCounters,
    computed_at: DateTime<Utc>,
) -> LockdownResult {
    LockdownResult {
        typing,
        integrity: counters.clone(),
        integrity_score: integrity_score(counters),
        computed_at,
    }
}

/// Applies one integrity signal to the counters. Non-violation events leave them untouched.
pub fn apply_event(counters: &mut IntegrityCounters, event_type: LockdownEventType) {
    match event_type {
        LockdownEventType::FocusLost => counters.focus_loss_count += 1,
        LockdownEventType::FullscreenExited | LockdownEventType::FullscreenDenied => {
            counters.fullscreen_exit_count += 1
        }
        LockdownEventType::PasteAttempt => counters.paste_attempts += 1,
        LockdownEventType::MultiTabDetected => counters.multi_tab_detected = true,
        LockdownEventType::SuspiciousInputBurst => counters.suspicious_burst_detected = true,
        _ => {}
    }
    if event_type.is_violation() {
        counters.warnings_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub max_focus_loss: u32,
    pub max_fullscreen_exit: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_focus_loss: 3,
            max_fullscreen_exit: 2,
        }
    }
}

impl From<&LockdownPolicy> for Thresholds {
    fn from(policy: &LockdownPolicy) -> Self {
        Self {
            max_focus_loss: policy.max_focus_loss,
            max_fullscreen_exit: policy.max_fullscreen_exit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroToleranceSignal {
    MultiTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSignal {
    FocusLoss,
    FullscreenExit,
}

/// A zero-tolerance signal ends the session on its first occurrence; a
/// threshold signal only once its count reaches the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    ZeroTolerance(ZeroToleranceSignal),
    ThresholdReached {
        signal: ThresholdSignal,
        count: u32,
        max: u32,
    },
}

impl Violation {
    pub fn reason(&self) -> String {
        match self {
            Violation::ZeroTolerance(ZeroToleranceSignal::MultiTab) => {
                "Assessment opened in multiple tabs; only one secure session may run at a time."
                    .to_string()
            }
            Violation::ThresholdReached {
                signal: ThresholdSignal::FocusLoss,
                count,
                max,
            } => format!(
                "Focus-loss threshold reached: the assessment window lost focus {} times (maximum {}).",
                count, max
            ),
            Violation::ThresholdReached {
                signal: ThresholdSignal::FullscreenExit,
                count,
                max,
            } => format!(
                "Fullscreen-exit threshold reached: fullscreen was left {} times (maximum {}).",
                count, max
            ),
        }
    }
}

/// Single evaluation point for termination. Zero-tolerance signals are checked first.
pub fn evaluate_violations(counters: &IntegrityCounters, thresholds: &Thresholds) -> Option<Violation> {
    if counters.multi_tab_detected {
        return Some(Violation::ZeroTolerance(ZeroToleranceSignal::MultiTab));
    }
    if counters.focus_loss_count >= thresholds.max_focus_loss {
        return Some(Violation::ThresholdReached {
            signal: ThresholdSignal::FocusLoss,
            count: counters.focus_loss_count,
            max: thresholds.max_focus_loss,
        });
    }
    if counters.fullscreen_exit_count >= thresholds.max_fullscreen_exit {
        return Some(Violation::ThresholdReached {
            signal: ThresholdSignal::FullscreenExit,
            count: counters.fullscreen_exit_count,
            max: thresholds.max_fullscreen_exit,
        });
    }
    None
}
