use serde::{Deserialize, Serialize};

/// Declarative environment payload produced by the browser probe and consumed by
/// the policy evaluator on both sides of the trust boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentChecks {
    pub touch_device: bool,
    pub viewport_too_small: bool,
    pub mobile_user_agent: bool,
    pub low_cpu_cores: bool,
    pub virtualized_gpu: bool,
    pub fullscreen_unavailable: bool,
    pub cross_tab_lock_unavailable: bool,
    pub webdriver: bool,
    pub viewport_width: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub gpu_renderer: Option<String>,
    pub fingerprint: Option<String>,
}
