//! Browser environment probe. Turns a raw capability snapshot into the
//! declarative `EnvironmentChecks` payload plus a device fingerprint.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::environment::EnvironmentChecks;
use crate::runtime::storage::{read_json, write_json, ClientStorage, StorageArea};
use crate::utils::crypto::fingerprint;

pub const MIN_VIEWPORT_WIDTH: u32 = 1024;
pub const MIN_CPU_CORES: u32 = 4;
pub const CACHE_KEY: &str = "lockdown.environmentProbe";
pub const CROSS_TAB_PROBE_KEY: &str = "lockdown.crossTabProbe";
pub const CACHE_FRESHNESS_SECS: i64 = 5 * 60;
pub const RESIZE_DEBOUNCE_MS: i64 = 250;

const MOBILE_UA_MARKERS: &[&str] = &[
    "android",
    "iphone",
    "ipad",
    "ipod",
    "mobile",
    "blackberry",
    "iemobile",
    "opera mini",
];

const AUTOMATION_UA_MARKERS: &[&str] = &[
    "headlesschrome",
    "phantomjs",
    "selenium",
    "webdriver",
    "puppeteer",
    "playwright",
];

const VIRTUAL_GPU_MARKERS: &[&str] = &[
    "swiftshader",
    "llvmpipe",
    "softpipe",
    "software rasterizer",
    "microsoft basic render",
    "virtualbox",
    "vmware",
    "svga3d",
    "parallels",
    "qxl",
    "virgl",
];

/// Raw capabilities read from the browser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserSnapshot {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub timezone: String,
    pub max_touch_points: u32,
    pub touch_events: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub hardware_concurrency: Option<u32>,
    pub gpu_renderer: Option<String>,
    pub webdriver_flag: bool,
    pub fullscreen_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTrigger {
    Mount,
    Focus,
    VisibilityChange,
    Resize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedProbe {
    at: DateTime<Utc>,
    checks: EnvironmentChecks,
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    needles.iter().any(|n| haystack.contains(n))
}

pub fn is_mobile_user_agent(user_agent: &str) -> bool {
    contains_any(user_agent, MOBILE_UA_MARKERS)
}

pub fn has_automation_marker(user_agent: &str) -> bool {
    contains_any(user_agent, AUTOMATION_UA_MARKERS)
}

pub fn is_virtualized_renderer(renderer: &str) -> bool {
    contains_any(renderer, VIRTUAL_GPU_MARKERS)
}

/// Shared-storage write-then-delete round trip.
pub fn cross_tab_lock_available(storage: &dyn ClientStorage) -> bool {
    let marker = Utc::now().timestamp_millis().to_string();
    if !storage.set(StorageArea::Shared, CROSS_TAB_PROBE_KEY, &marker) {
        return false;
    }
    let readable = storage.get(StorageArea::Shared, CROSS_TAB_PROBE_KEY).as_deref() == Some(&marker[..]);
    storage.remove(StorageArea::Shared, CROSS_TAB_PROBE_KEY);
    readable
}

pub fn device_fingerprint(snapshot: &BrowserSnapshot) -> String {
    let cores = snapshot
        .hardware_concurrency
        .map(|c| c.to_string())
        .unwrap_or_default();
    let viewport = format!("{}x{}", snapshot.viewport_width, snapshot.viewport_height);
    let screen = format!("{}x{}", snapshot.screen_width, snapshot.screen_height);
    fingerprint([
        snapshot.user_agent.as_str(),
        snapshot.platform.as_str(),
        snapshot.language.as_str(),
        cores.as_str(),
        viewport.as_str(),
        screen.as_str(),
        snapshot.timezone.as_str(),
        snapshot.gpu_renderer.as_deref().unwrap_or_default(),
    ])
}

/// Pure classification of a snapshot. The cross-tab capability needs storage
/// and is passed in.
pub fn classify(snapshot: &BrowserSnapshot, cross_tab_available: bool) -> EnvironmentChecks {
    let cores = snapshot.hardware_concurrency;
    EnvironmentChecks {
        touch_device: snapshot.max_touch_points > 0 || snapshot.touch_events,
        viewport_too_small: snapshot.viewport_width < MIN_VIEWPORT_WIDTH,
        mobile_user_agent: is_mobile_user_agent(&snapshot.user_agent),
        // Browsers that hide the core count are not penalized.
        low_cpu_cores: cores.map(|c| c < MIN_CPU_CORES).unwrap_or(false),
        virtualized_gpu: snapshot
            .gpu_renderer
            .as_deref()
            .map(is_virtualized_renderer)
            .unwrap_or(false),
        fullscreen_unavailable: !snapshot.fullscreen_enabled,
        cross_tab_lock_unavailable: !cross_tab_available,
        webdriver: snapshot.webdriver_flag || has_automation_marker(&snapshot.user_agent),
        viewport_width: Some(snapshot.viewport_width),
        cpu_cores: cores,
        gpu_renderer: snapshot.gpu_renderer.clone(),
        fingerprint: Some(device_fingerprint(snapshot)),
    }
}

/// Runs the probe on mount and re-runs it on focus, visibility and (debounced)
/// resize. Mount reuses a cached payload younger than five minutes.
pub struct EnvironmentProbe<'a> {
    storage: &'a dyn ClientStorage,
    last_resize: Option<DateTime<Utc>>,
    current: Option<EnvironmentChecks>,
}

impl<'a> EnvironmentProbe<'a> {
    pub fn new(storage: &'a dyn ClientStorage) -> Self {
        Self {
            storage,
            last_resize: None,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&EnvironmentChecks> {
        self.current.as_ref()
    }

    /// Returns the fresh payload when the trigger caused a (re)computation.
    pub fn on_trigger(
        &mut self,
        trigger: ProbeTrigger,
        snapshot: &BrowserSnapshot,
        now: DateTime<Utc>,
    ) -> Option<&EnvironmentChecks> {
        match trigger {
            ProbeTrigger::Mount => {
                if let Some(cached) = self.cached(now) {
                    self.current = Some(cached);
                    return self.current.as_ref();
                }
            }
            ProbeTrigger::Resize => {
                self.last_resize = Some(now);
                return None;
            }
            ProbeTrigger::Focus | ProbeTrigger::VisibilityChange => {}
        }
        Some(self.recompute(snapshot, now))
    }

    /// Completes a pending resize once the window stopped changing.
    pub fn settle(&mut self, snapshot: &BrowserSnapshot, now: DateTime<Utc>) -> Option<&EnvironmentChecks> {
        let last = self.last_resize?;
        if now - last < Duration::milliseconds(RESIZE_DEBOUNCE_MS) {
            return None;
        }
        self.last_resize = None;
        Some(self.recompute(snapshot, now))
    }

    fn cached(&self, now: DateTime<Utc>) -> Option<EnvironmentChecks> {
        let cached: CachedProbe = read_json(self.storage, StorageArea::Session, CACHE_KEY)?;
        let age = now - cached.at;
        (age >= Duration::zero() && age < Duration::seconds(CACHE_FRESHNESS_SECS))
            .then_some(cached.checks)
    }

    fn recompute(&mut self, snapshot: &BrowserSnapshot, now: DateTime<Utc>) -> &EnvironmentChecks {
        let checks = classify(snapshot, cross_tab_lock_available(self.storage));
        write_json(
            self.storage,
            StorageArea::Session,
            CACHE_KEY,
            &CachedProbe {
                at: now,
                checks: checks.clone(),
            },
        );
        self.current.insert(checks)
    }
}
