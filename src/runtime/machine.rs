//! Candidate-side lockdown state machine.
//!
//! `boot -> ready -> active -> {completed | terminated}`. Browser callbacks are
//! fed in as [`BrowserSignal`]s; the countdown and heartbeat run as tokio tasks
//! that are cancelled whenever the session leaves `active`. Local counters are
//! display-only; the server's counters come back on every event and heartbeat
//! response and its termination verdicts always win.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dto::lockdown_dto::{
    EventRequest, FinishRequest, FinishStatus, FinishSubmission, HeartbeatRequest, ReviewStatus,
};
use crate::models::lockdown_event::{LockdownEventType, Severity};
use crate::models::lockdown_session::{IntegrityCounters, LockdownResult, SessionStatus};
use crate::runtime::bootstrap::Bootstrap;
use crate::runtime::storage::{ActiveLock, ClientStorage, ACTIVE_LOCK_KEY};
use crate::runtime::transport::{LockdownTransport, TransportError};
use crate::services::integrity_service::{self, Thresholds};
use crate::services::typing_service::{TypingInput, TypingService};

pub const BURST_THRESHOLD_CHARS: usize = 10;
const MAX_KEYSTROKE_SAMPLES: usize = 20_000;
const MAX_REASON_CHARS: usize = 500;

pub const MISSING_BOOTSTRAP_REASON: &str =
    "This secure session could not be restored. Relaunch the assessment from your assessment list.";
pub const OTHER_TAB_REASON: &str =
    "Another secure assessment is open in a different tab. Close other tabs and try again.";
pub const CANDIDATE_EXIT_REASON: &str = "You ended the assessment before submitting.";
pub const SERVER_TERMINATED_REASON: &str = "The session was closed by the server.";
pub const SUBMISSION_UNDELIVERED_REASON: &str =
    "Your submission could not be delivered, so the session was closed. Contact the recruiter to arrange a retake.";
pub const CONNECTION_WARNING: &str =
    "Connection to the server was interrupted. Your session continues.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Boot,
    Ready,
    Active,
    Completed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub focus_throttle: Duration,
    pub burst_threshold: usize,
    pub thresholds: Thresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(8),
            focus_throttle: Duration::from_millis(350),
            burst_threshold: BURST_THRESHOLD_CHARS,
            thresholds: Thresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPress {
    pub key: String,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl KeyPress {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ctrl: false,
            meta: false,
            shift: false,
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    fn is_refresh(&self) -> bool {
        self.key == "F5" || ((self.ctrl || self.meta) && self.key.eq_ignore_ascii_case("r"))
    }

    fn is_devtools(&self) -> bool {
        self.key == "F12"
            || ((self.ctrl || self.meta)
                && self.shift
                && matches!(self.key.to_ascii_uppercase().as_str(), "I" | "J" | "C"))
    }

    fn is_input(&self) -> bool {
        self.key == "Backspace" || self.key.chars().count() == 1
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.ctrl {
            parts.push("Ctrl");
        }
        if self.meta {
            parts.push("Meta");
        }
        if self.shift {
            parts.push("Shift");
        }
        parts.push(self.key.as_str());
        parts.join("+")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrowserSignal {
    WindowBlur,
    DocumentHidden,
    FullscreenChanged { active: bool },
    Paste,
    Copy,
    Cut,
    KeyDown(KeyPress),
    InputChanged(String),
    StorageChanged { key: String, new_value: Option<String> },
    BeforeUnload,
}

/// What the page should do with the browser event that produced a signal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reaction {
    pub prevent_default: bool,
    pub confirm_unload: bool,
}

pub trait BrowserHost: Send + Sync {
    fn request_fullscreen(&self) -> Result<(), String>;

    fn exit_fullscreen(&self);
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActivationError {
    #[error("session cannot be activated from {0:?}")]
    NotReady(Phase),

    #[error("{}", OTHER_TAB_REASON)]
    OtherTabActive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSnapshot {
    pub phase: Phase,
    pub submitting: bool,
    pub remaining_sec: u32,
    pub local_display_counters: IntegrityCounters,
    pub server_confirmed_integrity: Option<IntegrityCounters>,
    pub termination_reason: Option<String>,
    pub activation_error: Option<String>,
    pub transient_warning: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub result: Option<LockdownResult>,
    pub backspace_count: u32,
}

struct RuntimeState {
    phase: Phase,
    bootstrap: Option<Bootstrap>,
    remaining_sec: u32,
    typed_text: String,
    backspace_count: u32,
    keystroke_intervals_ms: Vec<u32>,
    last_key_at: Option<Instant>,
    last_focus_loss_at: Option<Instant>,
    fullscreen_active: bool,
    local_display_counters: IntegrityCounters,
    server_confirmed_integrity: Option<IntegrityCounters>,
    finalized: bool,
    termination_reason: Option<String>,
    activation_error: Option<String>,
    transient_warning: Option<String>,
    review_status: Option<ReviewStatus>,
    result: Option<LockdownResult>,
    cancel: Option<CancellationToken>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            phase: Phase::Boot,
            bootstrap: None,
            remaining_sec: 0,
            typed_text: String::new(),
            backspace_count: 0,
            keystroke_intervals_ms: Vec::new(),
            last_key_at: None,
            last_focus_loss_at: None,
            fullscreen_active: false,
            local_display_counters: IntegrityCounters::default(),
            server_confirmed_integrity: None,
            finalized: false,
            termination_reason: None,
            activation_error: None,
            transient_warning: None,
            review_status: None,
            result: None,
            cancel: None,
        }
    }

    fn is_live(&self) -> bool {
        self.phase == Phase::Active && !self.finalized
    }

    fn ids(&self) -> Option<(String, String)> {
        self.bootstrap
            .as_ref()
            .map(|b| (b.session_id.clone(), b.device_id.clone()))
    }

    fn record_keystroke(&mut self, now: Instant) {
        if let Some(prev) = self.last_key_at {
            if self.keystroke_intervals_ms.len() < MAX_KEYSTROKE_SAMPLES {
                let ms = now.saturating_duration_since(prev).as_millis();
                self.keystroke_intervals_ms
                    .push(u32::try_from(ms).unwrap_or(u32::MAX));
            }
        }
        self.last_key_at = Some(now);
    }
}

/// Work left over after a signal was applied under the state lock.
#[derive(Default)]
struct Followup {
    event: Option<(LockdownEventType, String, Severity)>,
    terminated: Option<String>,
}

#[derive(Clone)]
pub struct LockdownRuntime {
    state: Arc<Mutex<RuntimeState>>,
    transport: Arc<dyn LockdownTransport>,
    storage: Arc<dyn ClientStorage>,
    host: Arc<dyn BrowserHost>,
    config: RuntimeConfig,
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl LockdownRuntime {
    /// Resolves `boot` into `ready` when a matching bootstrap is stored,
    /// otherwise into `terminated` without contacting the server.
    pub fn boot(
        session_id: &str,
        assessment_id: &str,
        transport: Arc<dyn LockdownTransport>,
        storage: Arc<dyn ClientStorage>,
        host: Arc<dyn BrowserHost>,
        config: RuntimeConfig,
    ) -> Self {
        let mut state = RuntimeState::new();
        match Bootstrap::load(storage.as_ref()).filter(|b| b.matches(session_id, assessment_id)) {
            Some(bootstrap) => {
                state.remaining_sec = remaining_after_reload(&bootstrap, Utc::now());
                state.bootstrap = Some(bootstrap);
                state.phase = Phase::Ready;
            }
            None => {
                tracing::warn!(session_id, assessment_id, "No matching bootstrap; refusing to start");
                state.phase = Phase::Terminated;
                state.finalized = true;
                state.activation_error = Some(MISSING_BOOTSTRAP_REASON.to_string());
            }
        }

        Self {
            state: Arc::new(Mutex::new(state)),
            transport,
            storage,
            host,
            config,
            tasks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub async fn snapshot(&self) -> RuntimeSnapshot {
        let state = self.state.lock().await;
        RuntimeSnapshot {
            phase: state.phase,
            submitting: state.phase == Phase::Active && state.finalized,
            remaining_sec: state.remaining_sec,
            local_display_counters: state.local_display_counters.clone(),
            server_confirmed_integrity: state.server_confirmed_integrity.clone(),
            termination_reason: state.termination_reason.clone(),
            activation_error: state.activation_error.clone(),
            transient_warning: state.transient_warning.clone(),
            review_status: state.review_status,
            result: state.result.clone(),
            backspace_count: state.backspace_count,
        }
    }

    pub async fn activate(&self) -> Result<(), ActivationError> {
        let denied = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Ready {
                return Err(ActivationError::NotReady(state.phase));
            }
            let Some((session_id, _)) = state.ids() else {
                return Err(ActivationError::NotReady(state.phase));
            };
            if let Some(lock) = ActiveLock::read(self.storage.as_ref()) {
                if lock.session_id != session_id {
                    state.activation_error = Some(OTHER_TAB_REASON.to_string());
                    return Err(ActivationError::OtherTabActive);
                }
            }

            // Fullscreen denial is tolerated: counted and reported, never blocking.
            let denied = match self.host.request_fullscreen() {
                Ok(()) => {
                    state.fullscreen_active = true;
                    None
                }
                Err(e) => Some(e),
            };

            let assessment_id = state
                .bootstrap
                .as_ref()
                .map(|b| b.assessment_id.clone())
                .unwrap_or_default();
            ActiveLock {
                session_id: session_id.clone(),
                assessment_id,
                at: Utc::now(),
            }
            .write(self.storage.as_ref());

            state.phase = Phase::Active;
            state.activation_error = None;
            let token = CancellationToken::new();
            state.cancel = Some(token.clone());
            self.spawn_loops(token);
            tracing::info!(session_id = %session_id, "Secure session active");

            denied.map(|e| {
                self.violation(
                    &mut state,
                    LockdownEventType::FullscreenDenied,
                    format!("Fullscreen request denied: {}", e),
                )
            })
        };

        if let Some(followup) = denied {
            tracing::warn!("Fullscreen unavailable; continuing without it");
            self.run(followup).await;
        }

        // Reloaded after the clock already ran out.
        let expired = self.state.lock().await.remaining_sec == 0;
        if expired {
            tracing::info!("Time already elapsed on activation; submitting");
            self.submit().await;
        }
        Ok(())
    }

    pub async fn handle_signal(&self, signal: BrowserSignal, now: Instant) -> Reaction {
        let mut reaction = Reaction::default();
        let mut followup = Followup::default();
        {
            let mut state = self.state.lock().await;
            let guarded =
                matches!(state.phase, Phase::Ready | Phase::Active) && !state.finalized;
            let live = state.is_live();

            match signal {
                BrowserSignal::BeforeUnload => reaction.confirm_unload = guarded,
                BrowserSignal::KeyDown(key) if guarded && key.is_refresh() => {
                    reaction.prevent_default = true;
                }
                BrowserSignal::KeyDown(key) if live && key.is_devtools() => {
                    reaction.prevent_default = true;
                    followup = self.violation(
                        &mut state,
                        LockdownEventType::KeyboardAnomaly,
                        format!("Blocked shortcut {}", key.describe()),
                    );
                }
                BrowserSignal::KeyDown(key) if live && key.is_input() => {
                    state.record_keystroke(now);
                    if key.key == "Backspace" {
                        state.backspace_count += 1;
                    }
                }
                _ if !live => {}
                BrowserSignal::KeyDown(_) => {}
                BrowserSignal::WindowBlur => {
                    followup = self.focus_lost(&mut state, now, "Window lost focus");
                }
                BrowserSignal::DocumentHidden => {
                    followup = self.focus_lost(&mut state, now, "Page hidden");
                }
                BrowserSignal::FullscreenChanged { active: true } => {
                    state.fullscreen_active = true;
                    followup.event =
                        Some((LockdownEventType::FullscreenEntered, String::new(), Severity::Info));
                }
                BrowserSignal::FullscreenChanged { active: false } => {
                    if state.fullscreen_active {
                        state.fullscreen_active = false;
                        followup = self.violation(
                            &mut state,
                            LockdownEventType::FullscreenExited,
                            "Left fullscreen".into(),
                        );
                    }
                }
                BrowserSignal::Paste => {
                    reaction.prevent_default = true;
                    followup = self.violation(
                        &mut state,
                        LockdownEventType::PasteAttempt,
                        "Paste blocked".into(),
                    );
                }
                BrowserSignal::Copy => {
                    reaction.prevent_default = true;
                    followup =
                        self.violation(&mut state, LockdownEventType::CopyAttempt, "Copy blocked".into());
                }
                BrowserSignal::Cut => {
                    reaction.prevent_default = true;
                    followup =
                        self.violation(&mut state, LockdownEventType::CutAttempt, "Cut blocked".into());
                }
                BrowserSignal::InputChanged(text) => {
                    let grown = text
                        .chars()
                        .count()
                        .saturating_sub(state.typed_text.chars().count());
                    state.typed_text = text;
                    if grown > self.config.burst_threshold
                        && !state.local_display_counters.suspicious_burst_detected
                    {
                        followup = self.violation(
                            &mut state,
                            LockdownEventType::SuspiciousInputBurst,
                            format!("{} characters arrived in one input update", grown),
                        );
                    }
                }
                BrowserSignal::StorageChanged { key, new_value } => {
                    let foreign = (key == ACTIVE_LOCK_KEY)
                        .then(|| new_value.as_deref().and_then(ActiveLock::parse))
                        .flatten()
                        .filter(|lock| {
                            state
                                .ids()
                                .map(|(own, _)| own != lock.session_id)
                                .unwrap_or(false)
                        });
                    if let Some(lock) = foreign {
                        followup = self.violation(
                            &mut state,
                            LockdownEventType::MultiTabDetected,
                            format!("Another tab started session {}", lock.session_id),
                        );
                    }
                }
            }
        }

        self.run(followup).await;
        reaction
    }

    /// Manual submission and timer expiry both land here; only the first
    /// caller finalizes.
    pub async fn submit(&self) {
        let req = {
            let mut state = self.state.lock().await;
            if !state.is_live() {
                return;
            }
            let Some(bootstrap) = state.bootstrap.clone() else {
                return;
            };
            state.finalized = true;

            let counted = bootstrap.duration_sec.saturating_sub(state.remaining_sec);
            let duration_sec = counted
                .max(elapsed_since_start(&bootstrap, Utc::now()))
                .clamp(1, bootstrap.duration_sec.max(1));
            let typing = TypingService::calculate_wpm_score(&TypingInput {
                prompt_text: &bootstrap.prompt_text,
                typed_text: &state.typed_text,
                duration_sec,
                backspace_count: state.backspace_count,
                keystroke_intervals_ms: &state.keystroke_intervals_ms,
            });
            state.result = Some(integrity_service::final_result(
                typing,
                &state.local_display_counters,
                Utc::now(),
            ));
            self.teardown(&mut state);

            FinishRequest {
                session_id: bootstrap.session_id.clone(),
                device_id: bootstrap.device_id.clone(),
                status: FinishStatus::Completed,
                termination_reason: None,
                result: Some(FinishSubmission {
                    typed_text: state.typed_text.clone(),
                    duration_sec,
                    backspace_count: state.backspace_count,
                    keystroke_intervals_ms: state.keystroke_intervals_ms.clone(),
                }),
            }
        };

        let outcome = self.transport.finish(req).await;
        let mut state = self.state.lock().await;
        match outcome {
            Ok(resp) => {
                state.review_status = Some(resp.review_status);
                if let Some(result) = resp.result {
                    state.server_confirmed_integrity = Some(result.integrity.clone());
                    state.result = Some(result);
                }
                if resp.status == SessionStatus::Completed {
                    state.phase = Phase::Completed;
                    tracing::info!("Submission accepted");
                } else {
                    state.phase = Phase::Terminated;
                    state.result = None;
                    state.termination_reason = Some(
                        resp.termination_reason
                            .unwrap_or_else(|| SERVER_TERMINATED_REASON.to_string()),
                    );
                }
            }
            Err(TransportError::Rejected { reason, .. }) => {
                tracing::warn!(reason = %reason, "Submission rejected by the server");
                state.phase = Phase::Terminated;
                state.result = None;
                state.termination_reason = Some(reason);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Submission could not be delivered");
                state.phase = Phase::Terminated;
                state.result = None;
                state.termination_reason = Some(SUBMISSION_UNDELIVERED_REASON.to_string());
            }
        }
    }

    /// Candidate confirmed leaving the assessment.
    pub async fn exit(&self) {
        let terminated = {
            let mut state = self.state.lock().await;
            state.is_live() && self.terminate(&mut state, CANDIDATE_EXIT_REASON.to_string())
        };
        if terminated {
            self.notify_termination(CANDIDATE_EXIT_REASON.to_string()).await;
        }
    }

    pub async fn tick_once(&self) {
        let expired = {
            let mut state = self.state.lock().await;
            if !state.is_live() {
                return;
            }
            state.remaining_sec = state.remaining_sec.saturating_sub(1);
            state.remaining_sec == 0
        };
        if expired {
            tracing::info!("Timer expired; submitting");
            self.submit().await;
        }
    }

    pub async fn heartbeat_once(&self) {
        let req = {
            let state = self.state.lock().await;
            if !state.is_live() {
                return;
            }
            let Some((session_id, device_id)) = state.ids() else {
                return;
            };
            HeartbeatRequest {
                session_id,
                device_id,
                timer_remaining_sec: Some(state.remaining_sec),
            }
        };

        let outcome = self.transport.heartbeat(req).await;
        let mut state = self.state.lock().await;
        match outcome {
            Ok(resp) => {
                state.server_confirmed_integrity = Some(resp.integrity);
                state.transient_warning = None;
                match resp.status {
                    SessionStatus::Active => {}
                    SessionStatus::Terminated => {
                        let reason = resp
                            .termination_reason
                            .unwrap_or_else(|| SERVER_TERMINATED_REASON.to_string());
                        tracing::warn!(reason = %reason, "Server terminated the session");
                        self.terminate(&mut state, reason);
                    }
                    SessionStatus::Completed => {
                        if !state.finalized {
                            state.finalized = true;
                            state.phase = Phase::Completed;
                            self.teardown(&mut state);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat failed");
                state.transient_warning = Some(CONNECTION_WARNING.to_string());
            }
        }
    }

    /// Waits for the countdown and heartbeat tasks to finish. They exit once
    /// the session leaves `active`.
    pub async fn join_background(&self) {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_loops(&self, token: CancellationToken) {
        let ticker = {
            let runtime = self.clone();
            let token = token.clone();
            let period = self.config.tick_interval;
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => runtime.tick_once().await,
                    }
                }
            })
        };
        let heartbeat = {
            let runtime = self.clone();
            let period = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => runtime.heartbeat_once().await,
                    }
                }
            })
        };
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend([ticker, heartbeat]),
            Err(poisoned) => poisoned.into_inner().extend([ticker, heartbeat]),
        }
    }

    /// Blur and visibility often report the same focus change; the second
    /// report inside the throttle window is dropped.
    fn focus_lost(&self, state: &mut RuntimeState, now: Instant, detail: &str) -> Followup {
        let throttled = state
            .last_focus_loss_at
            .map(|t| now.saturating_duration_since(t) < self.config.focus_throttle)
            .unwrap_or(false);
        if throttled {
            return Followup::default();
        }
        state.last_focus_loss_at = Some(now);
        self.violation(state, LockdownEventType::FocusLost, detail.to_string())
    }

    /// Applies a violation to the display counters and, if a threshold or
    /// zero-tolerance rule fires, terminates in the same critical section.
    fn violation(
        &self,
        state: &mut RuntimeState,
        event_type: LockdownEventType,
        detail: String,
    ) -> Followup {
        integrity_service::apply_event(&mut state.local_display_counters, event_type);
        let mut followup = Followup {
            event: Some((event_type, detail, event_type.minimum_severity())),
            terminated: None,
        };
        if let Some(violation) = integrity_service::evaluate_violations(
            &state.local_display_counters,
            &self.config.thresholds,
        ) {
            let reason = violation.reason();
            if self.terminate(state, reason.clone()) {
                followup.terminated = Some(reason);
            }
        }
        followup
    }

    /// Finalize latch for termination. Returns false if already finalized.
    fn terminate(&self, state: &mut RuntimeState, reason: String) -> bool {
        if state.finalized {
            return false;
        }
        state.finalized = true;
        state.phase = Phase::Terminated;
        tracing::warn!(reason = %reason, "Secure session terminated");
        state.termination_reason = Some(reason);
        self.teardown(state);
        true
    }

    fn teardown(&self, state: &mut RuntimeState) {
        if let Some(token) = state.cancel.take() {
            token.cancel();
        }
        if let Some((session_id, _)) = state.ids() {
            ActiveLock::release(self.storage.as_ref(), &session_id);
        }
        Bootstrap::clear(self.storage.as_ref());
        if state.fullscreen_active {
            state.fullscreen_active = false;
            self.host.exit_fullscreen();
        }
    }

    async fn run(&self, followup: Followup) {
        let mut server_terminated = false;
        if let Some((event_type, detail, severity)) = followup.event {
            server_terminated = self.report(event_type, detail, severity).await;
        }
        if let Some(reason) = followup.terminated {
            if !server_terminated {
                self.notify_termination(reason).await;
            }
        }
    }

    /// Posts one event. Returns true when the server reports the session terminated.
    async fn report(&self, event_type: LockdownEventType, detail: String, severity: Severity) -> bool {
        let Some((session_id, device_id)) = self.state.lock().await.ids() else {
            return false;
        };
        let req = EventRequest {
            session_id,
            device_id,
            event_type,
            detail: truncate(detail),
            severity,
        };

        let outcome = self.transport.post_event(req).await;
        let mut state = self.state.lock().await;
        match outcome {
            Ok(resp) => {
                state.server_confirmed_integrity = Some(resp.integrity);
                if resp.status == SessionStatus::Terminated {
                    let reason = resp
                        .termination_reason
                        .unwrap_or_else(|| SERVER_TERMINATED_REASON.to_string());
                    self.terminate(&mut state, reason);
                    return true;
                }
                false
            }
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = %e, "Integrity event not delivered");
                state.transient_warning = Some(CONNECTION_WARNING.to_string());
                false
            }
        }
    }

    /// Best effort; the local transition has already happened.
    async fn notify_termination(&self, reason: String) {
        let Some((session_id, device_id)) = self.state.lock().await.ids() else {
            return;
        };
        let req = FinishRequest {
            session_id,
            device_id,
            status: FinishStatus::Terminated,
            termination_reason: Some(truncate(reason)),
            result: None,
        };
        match self.transport.finish(req).await {
            Ok(resp) => self.state.lock().await.review_status = Some(resp.review_status),
            Err(e) => tracing::warn!(error = %e, "Termination notice not delivered"),
        }
    }
}

/// Whole seconds since the session started, capped at its duration.
fn elapsed_since_start(bootstrap: &Bootstrap, now: DateTime<Utc>) -> u32 {
    let elapsed = (now - bootstrap.started_at)
        .num_seconds()
        .clamp(0, i64::from(bootstrap.duration_sec));
    u32::try_from(elapsed).unwrap_or(bootstrap.duration_sec)
}

/// The countdown resumes from the server start time, not from the full duration.
fn remaining_after_reload(bootstrap: &Bootstrap, now: DateTime<Utc>) -> u32 {
    bootstrap
        .duration_sec
        .saturating_sub(elapsed_since_start(bootstrap, now))
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_REASON_CHARS {
        text
    } else {
        text.chars().take(MAX_REASON_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mockall::predicate::always;

    use crate::dto::lockdown_dto::{EventResponse, FinishResponse, HeartbeatResponse};
    use crate::models::lockdown_session::Prompt;
    use crate::runtime::storage::MemoryStorage;
    use crate::runtime::transport::MockLockdownTransport;

    const SESSION: &str = "lds_runtime";
    const ASSESSMENT: &str = "typing-speed";

    #[derive(Default)]
    struct FakeHost {
        deny: bool,
        exits: AtomicUsize,
    }

    impl BrowserHost for FakeHost {
        fn request_fullscreen(&self) -> Result<(), String> {
            if self.deny {
                Err("permission denied".into())
            } else {
                Ok(())
            }
        }

        fn exit_fullscreen(&self) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quiet_config() -> RuntimeConfig {
        RuntimeConfig {
            tick_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn seeded_storage() -> MemoryStorage {
        storage_started_at(Utc::now())
    }

    fn storage_started_at(started_at: chrono::DateTime<Utc>) -> MemoryStorage {
        let storage = MemoryStorage::new();
        Bootstrap {
            session_id: SESSION.into(),
            assessment_id: ASSESSMENT.into(),
            assessment_name: "Typing Speed".into(),
            device_id: "fp-device-0001".into(),
            prompt_id: "p1".into(),
            prompt_text: "hello world".into(),
            duration_sec: 60,
            started_at,
            policy_warnings: vec![],
        }
        .save(&storage);
        storage
    }

    fn event_ok(status: SessionStatus, reason: Option<&str>) -> EventResponse {
        EventResponse {
            status,
            integrity: IntegrityCounters::default(),
            termination_reason: reason.map(str::to_string),
        }
    }

    fn finish_ok(status: SessionStatus, review: ReviewStatus) -> FinishResponse {
        FinishResponse {
            status,
            completed_at: Some(Utc::now()),
            review_status: review,
            events_count: 3,
            termination_reason: None,
            result: None,
        }
    }

    fn runtime_with(
        transport: MockLockdownTransport,
        storage: MemoryStorage,
        host: FakeHost,
    ) -> (LockdownRuntime, Arc<FakeHost>) {
        let host = Arc::new(host);
        let runtime = LockdownRuntime::boot(
            SESSION,
            ASSESSMENT,
            Arc::new(transport),
            Arc::new(storage),
            host.clone(),
            quiet_config(),
        );
        (runtime, host)
    }

    #[tokio::test]
    async fn missing_bootstrap_terminates_without_server_call() {
        let (runtime, _) = runtime_with(MockLockdownTransport::new(), MemoryStorage::new(), FakeHost::default());
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Terminated);
        assert_eq!(snap.activation_error.as_deref(), Some(MISSING_BOOTSTRAP_REASON));
        assert!(runtime.activate().await.is_err());
    }

    #[tokio::test]
    async fn foreign_lock_blocks_activation() {
        let storage = seeded_storage();
        ActiveLock {
            session_id: "lds_other".into(),
            assessment_id: ASSESSMENT.into(),
            at: Utc::now(),
        }
        .write(&storage);
        let (runtime, _) = runtime_with(MockLockdownTransport::new(), storage, FakeHost::default());

        assert_eq!(runtime.activate().await, Err(ActivationError::OtherTabActive));
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Ready);
        assert_eq!(snap.activation_error.as_deref(), Some(OTHER_TAB_REASON));
    }

    #[tokio::test]
    async fn fullscreen_denial_is_counted_but_not_fatal() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_post_event()
            .withf(|req| {
                req.event_type == LockdownEventType::FullscreenDenied
                    && req.severity == Severity::Warning
            })
            .times(1)
            .returning(|_| Ok(event_ok(SessionStatus::Active, None)));
        let storage = seeded_storage();
        let (runtime, _) = runtime_with(
            transport,
            storage.clone(),
            FakeHost {
                deny: true,
                ..Default::default()
            },
        );

        tokio_test::assert_ok!(runtime.activate().await);
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.local_display_counters.fullscreen_exit_count, 1);
        assert_eq!(ActiveLock::read(&storage).map(|l| l.session_id), Some(SESSION.to_string()));
    }

    #[tokio::test]
    async fn blur_and_hidden_together_count_once() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_post_event()
            .times(2)
            .returning(|_| Ok(event_ok(SessionStatus::Active, None)));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        let t0 = Instant::now();
        runtime.handle_signal(BrowserSignal::WindowBlur, t0).await;
        runtime
            .handle_signal(BrowserSignal::DocumentHidden, t0 + Duration::from_millis(20))
            .await;
        assert_eq!(runtime.snapshot().await.local_display_counters.focus_loss_count, 1);

        runtime
            .handle_signal(BrowserSignal::WindowBlur, t0 + Duration::from_millis(800))
            .await;
        assert_eq!(runtime.snapshot().await.local_display_counters.focus_loss_count, 2);
    }

    #[tokio::test]
    async fn foreign_tab_lock_sets_flag_and_terminates_together() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_post_event()
            .withf(|req| req.event_type == LockdownEventType::MultiTabDetected)
            .times(1)
            .returning(|_| {
                Ok(event_ok(
                    SessionStatus::Terminated,
                    Some("Assessment opened in multiple tabs"),
                ))
            });
        transport.expect_finish().times(0);
        let storage = seeded_storage();
        let (runtime, host) = runtime_with(transport, storage.clone(), FakeHost::default());
        runtime.activate().await.unwrap();

        let foreign = serde_json::to_string(&ActiveLock {
            session_id: "lds_other".into(),
            assessment_id: ASSESSMENT.into(),
            at: Utc::now(),
        })
        .unwrap();
        runtime
            .handle_signal(
                BrowserSignal::StorageChanged {
                    key: ACTIVE_LOCK_KEY.into(),
                    new_value: Some(foreign),
                },
                Instant::now(),
            )
            .await;

        let snap = runtime.snapshot().await;
        assert!(snap.local_display_counters.multi_tab_detected);
        assert_eq!(snap.phase, Phase::Terminated);
        assert_eq!(host.exits.load(Ordering::SeqCst), 1);
        assert!(Bootstrap::load(&storage).is_none());
        tokio::time::timeout(Duration::from_secs(1), runtime.join_background())
            .await
            .expect("background tasks stop after termination");
    }

    #[tokio::test]
    async fn own_lock_echo_is_ignored() {
        let (runtime, _) = runtime_with(MockLockdownTransport::new(), seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();
        let own = serde_json::to_string(&ActiveLock {
            session_id: SESSION.into(),
            assessment_id: ASSESSMENT.into(),
            at: Utc::now(),
        })
        .unwrap();
        runtime
            .handle_signal(
                BrowserSignal::StorageChanged {
                    key: ACTIVE_LOCK_KEY.into(),
                    new_value: Some(own),
                },
                Instant::now(),
            )
            .await;
        assert_eq!(runtime.snapshot().await.phase, Phase::Active);
    }

    #[tokio::test]
    async fn server_termination_on_heartbeat_is_authoritative() {
        let mut transport = MockLockdownTransport::new();
        transport.expect_heartbeat().times(1).returning(|req| {
            Ok(HeartbeatResponse {
                session_id: req.session_id,
                status: SessionStatus::Terminated,
                termination_reason: Some("Connection lost".into()),
                prompt: Prompt {
                    id: "p1".into(),
                    text: "hello world".into(),
                },
                integrity: IntegrityCounters::default(),
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                events_count: 4,
            })
        });
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        runtime.heartbeat_once().await;
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Terminated);
        assert_eq!(snap.termination_reason.as_deref(), Some("Connection lost"));

        runtime.tick_once().await;
        assert_eq!(runtime.snapshot().await.remaining_sec, 60);
    }

    #[tokio::test]
    async fn failed_heartbeat_only_warns() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_heartbeat()
            .returning(|_| Err(TransportError::Network("offline".into())));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();
        runtime.heartbeat_once().await;
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.transient_warning.as_deref(), Some(CONNECTION_WARNING));
    }

    #[tokio::test]
    async fn concurrent_submits_finalize_once() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_finish()
            .withf(|req| req.status == FinishStatus::Completed && req.result.is_some())
            .times(1)
            .returning(|_| Ok(finish_ok(SessionStatus::Completed, ReviewStatus::Clear)));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();
        runtime
            .handle_signal(BrowserSignal::InputChanged("hello".into()), Instant::now())
            .await;

        tokio::join!(runtime.submit(), runtime.submit(), runtime.exit());
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.review_status, Some(ReviewStatus::Clear));
    }

    #[tokio::test]
    async fn undelivered_submission_terminates_with_reason() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_finish()
            .returning(|_| Err(TransportError::Network("connection reset".into())));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();
        runtime.submit().await;
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Terminated);
        assert_eq!(snap.termination_reason.as_deref(), Some(SUBMISSION_UNDELIVERED_REASON));
        assert!(snap.result.is_none());
    }

    #[tokio::test]
    async fn rejected_submission_uses_server_reason() {
        let mut transport = MockLockdownTransport::new();
        transport.expect_finish().returning(|_| {
            Err(TransportError::Rejected {
                status: 409,
                reason: "Session is no longer active".into(),
            })
        });
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();
        runtime.submit().await;
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Terminated);
        assert_eq!(snap.termination_reason.as_deref(), Some("Session is no longer active"));
    }

    #[tokio::test]
    async fn local_threshold_terminates_even_when_offline() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_post_event()
            .with(always())
            .returning(|_| Err(TransportError::Network("offline".into())));
        transport
            .expect_finish()
            .withf(|req| req.status == FinishStatus::Terminated && req.result.is_none())
            .times(1)
            .returning(|_| Err(TransportError::Network("offline".into())));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        let t0 = Instant::now();
        for i in 0..3u64 {
            runtime
                .handle_signal(BrowserSignal::WindowBlur, t0 + Duration::from_secs(i))
                .await;
        }
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Terminated);
        assert!(snap
            .termination_reason
            .as_deref()
            .unwrap()
            .contains("Focus-loss threshold"));
    }

    #[tokio::test]
    async fn paste_is_prevented_and_burst_flag_is_one_shot() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_post_event()
            .withf(|req| req.event_type == LockdownEventType::PasteAttempt)
            .times(1)
            .returning(|_| Ok(event_ok(SessionStatus::Active, None)));
        transport
            .expect_post_event()
            .withf(|req| req.event_type == LockdownEventType::SuspiciousInputBurst)
            .times(1)
            .returning(|_| Ok(event_ok(SessionStatus::Active, None)));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        let reaction = runtime.handle_signal(BrowserSignal::Paste, Instant::now()).await;
        assert!(reaction.prevent_default);

        let burst = "hello world, this arrived at once".to_string();
        runtime
            .handle_signal(BrowserSignal::InputChanged(burst.clone()), Instant::now())
            .await;
        runtime
            .handle_signal(
                BrowserSignal::InputChanged(format!("{} and again a lot more text", burst)),
                Instant::now(),
            )
            .await;
        let snap = runtime.snapshot().await;
        assert!(snap.local_display_counters.suspicious_burst_detected);
        assert_eq!(snap.local_display_counters.paste_attempts, 1);
        assert_eq!(snap.phase, Phase::Active);
    }

    #[tokio::test]
    async fn refresh_is_intercepted_while_ready() {
        let (runtime, _) = runtime_with(MockLockdownTransport::new(), seeded_storage(), FakeHost::default());
        let reaction = runtime
            .handle_signal(BrowserSignal::KeyDown(KeyPress::new("r").ctrl()), Instant::now())
            .await;
        assert!(reaction.prevent_default);
        let reaction = runtime
            .handle_signal(BrowserSignal::BeforeUnload, Instant::now())
            .await;
        assert!(reaction.confirm_unload);
    }

    #[tokio::test]
    async fn backspace_and_cadence_are_tracked() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_finish()
            .withf(|req| {
                req.result
                    .as_ref()
                    .map(|r| r.backspace_count == 1 && r.keystroke_intervals_ms.len() == 2)
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_| Ok(finish_ok(SessionStatus::Completed, ReviewStatus::Clear)));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        let t0 = Instant::now();
        runtime
            .handle_signal(BrowserSignal::KeyDown(KeyPress::new("h")), t0)
            .await;
        runtime
            .handle_signal(
                BrowserSignal::KeyDown(KeyPress::new("x")),
                t0 + Duration::from_millis(120),
            )
            .await;
        runtime
            .handle_signal(
                BrowserSignal::KeyDown(KeyPress::new("Backspace")),
                t0 + Duration::from_millis(260),
            )
            .await;
        assert_eq!(runtime.snapshot().await.backspace_count, 1);
        runtime.submit().await;
    }

    #[test]
    fn devtools_shortcuts_are_recognized() {
        assert!(KeyPress::new("F12").is_devtools());
        assert!(KeyPress::new("i").ctrl().shift().is_devtools());
        assert!(KeyPress::new("J").meta().shift().is_devtools());
        assert!(!KeyPress::new("i").ctrl().is_devtools());
        assert!(KeyPress::new("F5").is_refresh());
        assert!(KeyPress::new("R").meta().is_refresh());
        assert_eq!(KeyPress::new("I").ctrl().shift().describe(), "Ctrl+Shift+I");
    }

    #[tokio::test]
    async fn reload_resumes_countdown_from_start_time() {
        let storage = storage_started_at(Utc::now() - chrono::Duration::seconds(50));
        let (runtime, _) = runtime_with(MockLockdownTransport::new(), storage, FakeHost::default());
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Ready);
        assert!((9..=10).contains(&snap.remaining_sec), "remaining {}", snap.remaining_sec);
    }

    #[tokio::test]
    async fn reload_after_deadline_submits_on_activation() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_finish()
            .withf(|req| {
                req.status == FinishStatus::Completed
                    && req.result.as_ref().map(|r| r.duration_sec) == Some(60)
            })
            .times(1)
            .returning(|_| Ok(finish_ok(SessionStatus::Completed, ReviewStatus::Clear)));
        let storage = storage_started_at(Utc::now() - chrono::Duration::seconds(90));
        let (runtime, _) = runtime_with(transport, storage, FakeHost::default());
        assert_eq!(runtime.snapshot().await.remaining_sec, 0);

        tokio_test::assert_ok!(runtime.activate().await);
        assert_eq!(runtime.snapshot().await.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn timer_expiry_finalizes_exactly_once() {
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_finish()
            .withf(|req| {
                req.status == FinishStatus::Completed
                    && req.result.as_ref().map(|r| r.duration_sec) == Some(60)
            })
            .times(1)
            .returning(|_| Ok(finish_ok(SessionStatus::Completed, ReviewStatus::NeedsReview)));
        let (runtime, _) = runtime_with(transport, seeded_storage(), FakeHost::default());
        runtime.activate().await.unwrap();

        for _ in 0..59 {
            runtime.tick_once().await;
        }
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Active);
        assert_eq!(snap.remaining_sec, 1);

        runtime.tick_once().await;
        runtime.tick_once().await;
        let snap = runtime.snapshot().await;
        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.remaining_sec, 0);
        assert_eq!(snap.review_status, Some(ReviewStatus::NeedsReview));
        tokio::time::timeout(Duration::from_secs(1), runtime.join_background())
            .await
            .expect("timers stop after completion");
    }
}
