use serde::{Deserialize, Serialize};

use crate::models::environment::EnvironmentChecks;

pub const REASON_TOUCH_DEVICE: &str =
    "Touch input devices are not supported for secure assessments.";
pub const REASON_SMALL_SCREEN: &str =
    "A desktop or laptop browser with a wide enough window is required.";
pub const REASON_LOW_CPU: &str = "This device does not meet the minimum processor requirement.";
pub const REASON_VIRTUAL_GPU: &str =
    "Virtual machines and software graphics renderers are not supported.";
pub const REASON_NO_FULLSCREEN: &str = "This browser does not support fullscreen mode.";
pub const REASON_NO_CROSS_TAB_LOCK: &str =
    "Browser storage is unavailable, so the single-tab lock cannot be enforced.";
pub const WARNING_AUTOMATION: &str =
    "Browser automation indicators were detected; this session will be flagged for review.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub blocking_reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl PolicyDecision {
    pub fn is_blocked(&self) -> bool {
        !self.blocking_reasons.is_empty()
    }
}

/// Maps an environment payload to a launch decision. Every check runs, so a
/// blocked environment reports all of its reasons at once.
pub fn evaluate(checks: &EnvironmentChecks) -> PolicyDecision {
    let mut decision = PolicyDecision::default();

    if checks.touch_device {
        decision.blocking_reasons.push(REASON_TOUCH_DEVICE.to_string());
    }
    if checks.viewport_too_small || checks.mobile_user_agent {
        decision.blocking_reasons.push(REASON_SMALL_SCREEN.to_string());
    }
    if checks.low_cpu_cores {
        decision.blocking_reasons.push(REASON_LOW_CPU.to_string());
    }
    if checks.virtualized_gpu {
        decision.blocking_reasons.push(REASON_VIRTUAL_GPU.to_string());
    }
    if checks.fullscreen_unavailable {
        decision.blocking_reasons.push(REASON_NO_FULLSCREEN.to_string());
    }
    if checks.cross_tab_lock_unavailable {
        decision
            .blocking_reasons
            .push(REASON_NO_CROSS_TAB_LOCK.to_string());
    }
    if checks.webdriver {
        decision.warnings.push(WARNING_AUTOMATION.to_string());
    }

    decision
}
