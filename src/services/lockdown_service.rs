use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::LockdownPolicy;
use crate::database::event_log::EventLog;
use crate::database::pool::Stores;
use crate::database::session_store::{session_not_found, transition_conflict, SessionStore};
use crate::dto::lockdown_dto::{
    AssessmentInfo, EventRequest, EventResponse, FinishRequest, FinishResponse, FinishStatus,
    HeartbeatRequest, HeartbeatResponse, ReviewStatus, SessionEventsResponse, StartRequest,
    StartResponse,
};
use crate::error::{Error, Result};
use crate::models::lockdown_event::{LockdownEventType, Severity};
use crate::models::lockdown_session::{
    IntegrityCounters, LockdownSession, NewSession, SessionStatus,
};
use crate::services::integrity_service::{self, Thresholds};
use crate::services::policy_service;
use crate::services::prompt_service::find_assessment;
use crate::services::typing_service::{TypingInput, TypingService};
use crate::utils::crypto::device_matches;
use crate::utils::validation::validate;

pub const CANDIDATE_EXIT_REASON: &str = "The candidate ended the assessment early.";
pub const HEARTBEAT_LOST_REASON: &str =
    "Connection lost: the assessment page stopped sending heartbeats.";
pub const TIME_LIMIT_REASON: &str = "Assessment time limit exceeded without a submission.";
const CLEAR_REVIEW_MIN_SCORE: u8 = 70;

#[derive(Clone)]
pub struct LockdownService {
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn EventLog>,
    policy: LockdownPolicy,
    thresholds: Thresholds,
}

impl LockdownService {
    pub fn new(stores: Stores, policy: LockdownPolicy) -> Self {
        Self {
            sessions: stores.sessions,
            events: stores.events,
            thresholds: Thresholds::from(&policy),
            policy,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub async fn start(&self, caller: &str, req: StartRequest) -> Result<StartResponse> {
        validate(&req)?;
        if !req.acknowledged {
            return Err(Error::BadRequest(
                "The assessment rules must be acknowledged before starting".to_string(),
            ));
        }
        if let Some(fingerprint) = req.environment.fingerprint.as_deref() {
            if !device_matches(fingerprint, &req.device_id) {
                return Err(Error::BadRequest(
                    "Device id does not match the environment fingerprint".to_string(),
                ));
            }
        }
        let assessment = find_assessment(&req.assessment_id).ok_or_else(|| {
            Error::NotFound(format!("Assessment {} not found", req.assessment_id))
        })?;

        let decision = policy_service::evaluate(&req.environment);
        if decision.is_blocked() {
            tracing::warn!(
                candidate = caller,
                assessment_id = assessment.id,
                reasons = ?decision.blocking_reasons,
                "Secure session launch refused by environment policy"
            );
            return Err(Error::PolicyRejected {
                reasons: decision.blocking_reasons,
                warnings: decision.warnings,
            });
        }

        let session = self
            .sessions
            .create_session(NewSession {
                candidate_user_id: caller.to_string(),
                assessment_id: assessment.id.to_string(),
                assessment_name: assessment.name.to_string(),
                device_id: req.device_id.clone(),
            })
            .await?;
        let id = session.session_id.as_str();
        self.events
            .append_event(
                id,
                LockdownEventType::SessionStarted,
                &format!("assessment={} prompt={}", assessment.id, session.prompt.id),
                Severity::Info,
            )
            .await?;

        for warning in &decision.warnings {
            self.sessions
                .update_integrity_counters(id, &|c: &mut IntegrityCounters| {
                    integrity_service::apply_event(c, LockdownEventType::AutomationFlagged)
                })
                .await?;
            self.events
                .append_event(
                    id,
                    LockdownEventType::AutomationFlagged,
                    warning,
                    Severity::Warning,
                )
                .await?;
        }

        tracing::info!(
            session_id = id,
            candidate = caller,
            assessment_id = assessment.id,
            warnings = decision.warnings.len(),
            "Lockdown session started"
        );

        Ok(StartResponse {
            session_id: session.session_id.clone(),
            assessment: AssessmentInfo {
                id: assessment.id.to_string(),
                name: assessment.name.to_string(),
                prompt_id: session.prompt.id.clone(),
                prompt_text: session.prompt.text.clone(),
                duration_sec: assessment.duration_sec,
            },
            started_at: session.started_at,
            policy_warnings: decision.warnings,
        })
    }

    pub async fn heartbeat(&self, caller: &str, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.heartbeat_at(caller, req, Utc::now()).await
    }

    async fn heartbeat_at(
        &self,
        caller: &str,
        req: HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        validate(&req)?;
        let session = self
            .load_authorized(caller, &req.session_id, &req.device_id)
            .await?;
        if !session.is_active() {
            return self.heartbeat_response(session).await;
        }

        let mut session = self.sessions.touch_session(&session.session_id).await?;
        let remaining = req
            .timer_remaining_sec
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "unknown".to_string());
        self.events
            .append_event(
                &session.session_id,
                LockdownEventType::Heartbeat,
                &format!("timer_remaining={}", remaining),
                Severity::Info,
            )
            .await?;

        if self.is_overrun(&session, now) {
            session = self.terminate(&session.session_id, TIME_LIMIT_REASON).await?;
        }

        self.heartbeat_response(session).await
    }

    pub async fn record_event(&self, caller: &str, req: EventRequest) -> Result<EventResponse> {
        validate(&req)?;
        if !req.event_type.is_client_reportable() {
            return Err(Error::BadRequest(format!(
                "Event type {} is recorded by the server only",
                req.event_type
            )));
        }
        let session = self
            .load_authorized(caller, &req.session_id, &req.device_id)
            .await?;
        let event_type = req.event_type;
        let severity = req.severity.max(event_type.minimum_severity());
        let id = session.session_id.clone();

        if !session.is_active() {
            self.events
                .append_event(
                    &id,
                    event_type,
                    &format!("after {}: {}", session.status, req.detail),
                    severity,
                )
                .await?;
            return Ok(event_response(&session));
        }

        let mut session = if event_type.is_violation() {
            match self
                .sessions
                .update_integrity_counters(&id, &|c: &mut IntegrityCounters| {
                    integrity_service::apply_event(c, event_type)
                })
                .await
            {
                Ok(updated) => updated,
                // Lost a race with a terminal transition: log the event, report the final state.
                Err(Error::Conflict(_)) => {
                    let current = self.reload(&id).await?;
                    self.events
                        .append_event(&id, event_type, &req.detail, severity)
                        .await?;
                    return Ok(event_response(&current));
                }
                Err(e) => return Err(e),
            }
        } else {
            session
        };

        self.events
            .append_event(&id, event_type, &req.detail, severity)
            .await?;
        tracing::info!(
            session_id = %id,
            event_type = %event_type,
            focus_loss = session.integrity.focus_loss_count,
            fullscreen_exit = session.integrity.fullscreen_exit_count,
            paste = session.integrity.paste_attempts,
            "Integrity event recorded"
        );

        if let Some(violation) =
            integrity_service::evaluate_violations(&session.integrity, &self.thresholds)
        {
            session = self.terminate(&id, &violation.reason()).await?;
        }

        Ok(event_response(&session))
    }

    pub async fn finish(&self, caller: &str, req: FinishRequest) -> Result<FinishResponse> {
        self.finish_at(caller, req, Utc::now()).await
    }

    async fn finish_at(
        &self,
        caller: &str,
        req: FinishRequest,
        now: DateTime<Utc>,
    ) -> Result<FinishResponse> {
        validate(&req)?;
        let session = self
            .load_authorized(caller, &req.session_id, &req.device_id)
            .await?;
        if !session.is_active() {
            return Err(transition_conflict(&session));
        }
        let id = session.session_id.clone();

        let session = match req.status {
            FinishStatus::Terminated => {
                let reason = req
                    .termination_reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(CANDIDATE_EXIT_REASON);
                self.terminate(&id, reason).await?
            }
            FinishStatus::Completed => {
                let submission = req.result.ok_or_else(|| {
                    Error::BadRequest("result is required when completing a session".to_string())
                })?;
                validate(&submission)?;
                let typed_len = submission.typed_text.chars().count();
                let max_len = session.prompt.text.chars().count() * 4 + 256;
                if typed_len > max_len {
                    return Err(Error::BadRequest(format!(
                        "Typed text is too long ({} characters, maximum {})",
                        typed_len, max_len
                    )));
                }
                let duration_sec = self.scoring_duration(&session, submission.duration_sec, now);
                let typing = TypingService::calculate_wpm_score(&TypingInput {
                    prompt_text: &session.prompt.text,
                    typed_text: &submission.typed_text,
                    duration_sec,
                    backspace_count: submission.backspace_count,
                    keystroke_intervals_ms: &submission.keystroke_intervals_ms,
                });
                if duration_sec != submission.duration_sec {
                    tracing::warn!(
                        session_id = %id,
                        claimed = submission.duration_sec,
                        scored = duration_sec,
                        "Submitted duration corrected from server clock"
                    );
                }

                self.events
                    .append_event(
                        &id,
                        LockdownEventType::Submitted,
                        &format!("typed_characters={}", typed_len),
                        Severity::Info,
                    )
                    .await?;
                let completed = self.sessions.complete_session(&id, typing).await?;
                if let Some(result) = completed.result.as_ref() {
                    self.events
                        .append_event(
                            &id,
                            LockdownEventType::SessionCompleted,
                            &format!(
                                "net_wpm={} accuracy={} integrity_score={}",
                                result.typing.net_wpm, result.typing.accuracy, result.integrity_score
                            ),
                            Severity::Info,
                        )
                        .await?;
                    tracing::info!(
                        session_id = %id,
                        net_wpm = result.typing.net_wpm,
                        accuracy = result.typing.accuracy,
                        integrity_score = result.integrity_score,
                        "Lockdown session completed"
                    );
                }
                completed
            }
        };

        let events_count = self.events.count_events(&id).await?;
        Ok(FinishResponse {
            status: session.status,
            completed_at: session.completed_at,
            review_status: review_status(&session),
            events_count,
            termination_reason: session.termination_reason.clone(),
            result: session.result.clone(),
        })
    }

    /// Reviewer replay of one session.
    pub async fn session_events(&self, session_id: &str) -> Result<SessionEventsResponse> {
        let session = self.reload(session_id).await?;
        let events = self.events.get_events(session_id).await?;
        Ok(SessionEventsResponse { session, events })
    }

    /// Terminates active sessions that stopped heartbeating or ran past their
    /// time limit. Returns how many were terminated.
    pub async fn sweep_stale_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = Duration::seconds(self.policy.heartbeat_timeout_sec);
        let mut terminated = 0;
        for session in self.sessions.list_active_sessions().await? {
            let reason = if now - session.last_heartbeat_at > timeout {
                HEARTBEAT_LOST_REASON
            } else if self.is_overrun(&session, now) {
                TIME_LIMIT_REASON
            } else {
                continue;
            };
            match self.terminate(&session.session_id, reason).await {
                Ok(s) if s.status == SessionStatus::Terminated => terminated += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(
                    session_id = %session.session_id,
                    error = ?e,
                    "Failed to terminate stale session"
                ),
            }
        }
        Ok(terminated)
    }

    /// Duration used for scoring. The server's elapsed time, less the grace
    /// allowance for latency, is a floor under the client's claim; the
    /// assessment duration is the ceiling.
    fn scoring_duration(&self, session: &LockdownSession, claimed: u32, now: DateTime<Utc>) -> u32 {
        let limit = find_assessment(&session.assessment_id)
            .map(|a| a.duration_sec)
            .unwrap_or(claimed)
            .max(1);
        let observed = ((now - session.started_at).num_seconds() - self.policy.overrun_grace_sec)
            .clamp(0, i64::from(limit));
        let observed = u32::try_from(observed).unwrap_or(limit);
        claimed.max(observed).clamp(1, limit)
    }

    fn is_overrun(&self, session: &LockdownSession, now: DateTime<Utc>) -> bool {
        match find_assessment(&session.assessment_id) {
            Some(assessment) => {
                let limit = Duration::seconds(
                    assessment.duration_sec as i64 + self.policy.overrun_grace_sec,
                );
                now - session.started_at > limit
            }
            None => false,
        }
    }

    async fn load_authorized(
        &self,
        caller: &str,
        session_id: &str,
        device_id: &str,
    ) -> Result<LockdownSession> {
        let session = self.reload(session_id).await?;
        if session.candidate_user_id != caller {
            return Err(Error::Forbidden(
                "This session belongs to another candidate".to_string(),
            ));
        }
        if !device_matches(&session.device_id, device_id) {
            tracing::warn!(session_id, "Device fingerprint mismatch");
            return Err(Error::Forbidden(
                "Device fingerprint does not match this session".to_string(),
            ));
        }
        Ok(session)
    }

    async fn reload(&self, session_id: &str) -> Result<LockdownSession> {
        self.sessions
            .get_session_by_id(session_id)
            .await?
            .ok_or_else(|| session_not_found(session_id))
    }

    /// Terminates and records the audit event. If another request already
    /// moved the session to a terminal state, returns that state unchanged.
    async fn terminate(&self, session_id: &str, reason: &str) -> Result<LockdownSession> {
        match self.sessions.terminate_session(session_id, reason).await {
            Ok(session) => {
                tracing::warn!(session_id, reason, "Lockdown session terminated");
                self.events
                    .append_event(
                        session_id,
                        LockdownEventType::SessionTerminated,
                        reason,
                        Severity::Critical,
                    )
                    .await?;
                Ok(session)
            }
            Err(Error::Conflict(_)) => self.reload(session_id).await,
            Err(e) => Err(e),
        }
    }

    async fn heartbeat_response(&self, session: LockdownSession) -> Result<HeartbeatResponse> {
        let events_count = self.events.count_events(&session.session_id).await?;
        Ok(HeartbeatResponse {
            session_id: session.session_id,
            status: session.status,
            termination_reason: session.termination_reason,
            prompt: session.prompt,
            integrity: session.integrity,
            started_at: session.started_at,
            completed_at: session.completed_at,
            events_count,
        })
    }
}

fn event_response(session: &LockdownSession) -> EventResponse {
    EventResponse {
        status: session.status,
        integrity: session.integrity.clone(),
        termination_reason: session.termination_reason.clone(),
    }
}

pub fn review_status(session: &LockdownSession) -> ReviewStatus {
    match (session.status, session.result.as_ref()) {
        (SessionStatus::Terminated, _) => ReviewStatus::Flagged,
        (SessionStatus::Completed, Some(result))
            if result.integrity_score >= CLEAR_REVIEW_MIN_SCORE
                && !result.integrity.suspicious_burst_detected
                && !result.integrity.multi_tab_detected =>
        {
            ReviewStatus::Clear
        }
        _ => ReviewStatus::NeedsReview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::lockdown_dto::FinishSubmission;
    use crate::models::environment::EnvironmentChecks;

    const CANDIDATE: &str = "candidate-7";
    const DEVICE: &str = "fp-0123456789abcdef";

    fn service() -> LockdownService {
        LockdownService::new(Stores::in_memory(), LockdownPolicy::default())
    }

    fn start_request() -> StartRequest {
        StartRequest {
            assessment_id: "typing-speed".into(),
            device_id: DEVICE.into(),
            environment: EnvironmentChecks::default(),
            acknowledged: true,
        }
    }

    fn event(session_id: &str, event_type: LockdownEventType) -> EventRequest {
        EventRequest {
            session_id: session_id.into(),
            device_id: DEVICE.into(),
            event_type,
            detail: String::new(),
            severity: Severity::Warning,
        }
    }

    fn finish_completed(session_id: &str, typed: &str) -> FinishRequest {
        FinishRequest {
            session_id: session_id.into(),
            device_id: DEVICE.into(),
            status: FinishStatus::Completed,
            termination_reason: None,
            result: Some(FinishSubmission {
                typed_text: typed.into(),
                duration_sec: 60,
                backspace_count: 0,
                keystroke_intervals_ms: vec![120, 140, 130],
            }),
        }
    }

    #[tokio::test]
    async fn blocked_environment_is_rejected_with_all_reasons() {
        let svc = service();
        let mut req = start_request();
        req.environment.touch_device = true;
        req.environment.low_cpu_cores = true;
        req.environment.webdriver = true;
        match svc.start(CANDIDATE, req).await {
            Err(Error::PolicyRejected { reasons, warnings }) => {
                assert_eq!(reasons.len(), 2);
                assert_eq!(warnings.len(), 1);
            }
            other => panic!("expected policy rejection, got {:?}", other.map(|r| r.session_id)),
        }
    }

    #[tokio::test]
    async fn unacknowledged_or_unknown_assessment_is_refused() {
        let svc = service();
        let mut req = start_request();
        req.acknowledged = false;
        assert!(matches!(svc.start(CANDIDATE, req).await, Err(Error::BadRequest(_))));

        let mut req = start_request();
        req.assessment_id = "does-not-exist".into();
        assert!(matches!(svc.start(CANDIDATE, req).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn automation_warning_is_recorded_but_does_not_block() {
        let svc = service();
        let mut req = start_request();
        req.environment.webdriver = true;
        let started = svc.start(CANDIDATE, req).await.unwrap();
        assert_eq!(started.policy_warnings.len(), 1);

        let replay = svc.session_events(&started.session_id).await.unwrap();
        assert_eq!(replay.events[0].event_type, LockdownEventType::SessionStarted);
        assert!(replay
            .events
            .iter()
            .any(|e| e.event_type == LockdownEventType::AutomationFlagged));
        assert_eq!(replay.session.integrity.warnings_count, 1);
    }

    #[tokio::test]
    async fn two_focus_losses_then_submit_scores_80() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();

        for _ in 0..2 {
            let resp = svc
                .record_event(CANDIDATE, event(&id, LockdownEventType::FocusLost))
                .await
                .unwrap();
            assert_eq!(resp.status, SessionStatus::Active);
        }
        let hb = svc
            .heartbeat(
                CANDIDATE,
                HeartbeatRequest {
                    session_id: id.clone(),
                    device_id: DEVICE.into(),
                    timer_remaining_sec: Some(30),
                },
            )
            .await
            .unwrap();
        assert_eq!(hb.status, SessionStatus::Active);
        assert_eq!(hb.integrity.focus_loss_count, 2);

        let prompt = started.assessment.prompt_text.clone();
        let done = svc.finish(CANDIDATE, finish_completed(&id, &prompt)).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.integrity_score, 80);
        assert_eq!(result.typing.accuracy, 100.0);
        assert_eq!(result.typing.total_errors, 0);
        assert_eq!(done.review_status, ReviewStatus::Clear);
    }

    #[tokio::test]
    async fn focus_loss_threshold_terminates_without_result() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();

        let mut last = None;
        for _ in 0..LockdownPolicy::default().max_focus_loss {
            last = Some(
                svc.record_event(CANDIDATE, event(&id, LockdownEventType::FocusLost))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert_eq!(last.status, SessionStatus::Terminated);
        assert!(last
            .termination_reason
            .as_deref()
            .unwrap()
            .contains("Focus-loss threshold"));

        let finish = svc.finish(CANDIDATE, finish_completed(&id, "late")).await;
        assert!(matches!(finish, Err(Error::Conflict(_))));
        let replay = svc.session_events(&id).await.unwrap();
        assert!(replay.session.result.is_none());
        assert_eq!(
            replay.events.last().map(|e| e.event_type),
            Some(LockdownEventType::SessionTerminated)
        );
    }

    #[tokio::test]
    async fn multi_tab_terminates_on_first_report() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let resp = svc
            .record_event(
                CANDIDATE,
                event(&started.session_id, LockdownEventType::MultiTabDetected),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, SessionStatus::Terminated);
        assert!(resp.integrity.multi_tab_detected);
    }

    #[tokio::test]
    async fn events_after_termination_are_logged_but_do_not_count() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();
        svc.record_event(CANDIDATE, event(&id, LockdownEventType::MultiTabDetected))
            .await
            .unwrap();

        let before = svc.session_events(&id).await.unwrap();
        let resp = svc
            .record_event(CANDIDATE, event(&id, LockdownEventType::PasteAttempt))
            .await
            .unwrap();
        assert_eq!(resp.status, SessionStatus::Terminated);
        assert_eq!(resp.integrity.paste_attempts, 0);
        let after = svc.session_events(&id).await.unwrap();
        assert_eq!(after.events.len(), before.events.len() + 1);
    }

    #[tokio::test]
    async fn ownership_and_device_are_enforced() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();

        let other_caller = svc
            .record_event("someone-else", event(&id, LockdownEventType::FocusLost))
            .await;
        assert!(matches!(other_caller, Err(Error::Forbidden(_))));

        let mut wrong_device = event(&id, LockdownEventType::FocusLost);
        wrong_device.device_id = "fp-ffffffffffffffff".into();
        assert!(matches!(
            svc.record_event(CANDIDATE, wrong_device).await,
            Err(Error::Forbidden(_))
        ));

        let lifecycle = event(&id, LockdownEventType::SessionCompleted);
        assert!(matches!(
            svc.record_event(CANDIDATE, lifecycle).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn candidate_exit_and_double_finish() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();
        let exit = FinishRequest {
            session_id: id.clone(),
            device_id: DEVICE.into(),
            status: FinishStatus::Terminated,
            termination_reason: None,
            result: None,
        };
        let resp = svc.finish(CANDIDATE, exit.clone()).await.unwrap();
        assert_eq!(resp.status, SessionStatus::Terminated);
        assert_eq!(resp.review_status, ReviewStatus::Flagged);
        assert_eq!(resp.termination_reason.as_deref(), Some(CANDIDATE_EXIT_REASON));

        assert!(matches!(svc.finish(CANDIDATE, exit).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn completing_requires_a_result() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let mut req = finish_completed(&started.session_id, "x");
        req.result = None;
        assert!(matches!(svc.finish(CANDIDATE, req).await, Err(Error::BadRequest(_))));

        let huge = "x".repeat(started.assessment.prompt_text.len() * 4 + 300);
        let req = finish_completed(&started.session_id, &huge);
        assert!(matches!(svc.finish(CANDIDATE, req).await, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn sweeper_terminates_silent_sessions() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        assert_eq!(svc.sweep_stale_sessions(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::seconds(LockdownPolicy::default().heartbeat_timeout_sec + 1);
        assert_eq!(svc.sweep_stale_sessions(later).await.unwrap(), 1);
        let replay = svc.session_events(&started.session_id).await.unwrap();
        assert_eq!(replay.session.status, SessionStatus::Terminated);
        assert_eq!(
            replay.session.termination_reason.as_deref(),
            Some(HEARTBEAT_LOST_REASON)
        );
    }

    fn heartbeat_request(session_id: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            session_id: session_id.into(),
            device_id: DEVICE.into(),
            timer_remaining_sec: Some(0),
        }
    }

    #[tokio::test]
    async fn understated_duration_is_raised_to_server_elapsed_time() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let prompt = started.assessment.prompt_text.clone();
        let mut req = finish_completed(&started.session_id, &prompt);
        if let Some(submission) = req.result.as_mut() {
            submission.duration_sec = 1;
        }

        let grace = LockdownPolicy::default().overrun_grace_sec;
        let at = started.started_at + Duration::seconds(40);
        let done = svc.finish_at(CANDIDATE, req, at).await.unwrap();
        let typing = done.result.unwrap().typing;
        assert_eq!(typing.duration_sec, (40 - grace) as u32);

        let honest = TypingService::calculate_wpm_score(&TypingInput {
            prompt_text: &prompt,
            typed_text: &prompt,
            duration_sec: (40 - grace) as u32,
            backspace_count: 0,
            keystroke_intervals_ms: &[120, 140, 130],
        });
        assert_eq!(typing.net_wpm, honest.net_wpm);
    }

    #[tokio::test]
    async fn claimed_duration_never_exceeds_the_assessment() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let mut req = finish_completed(&started.session_id, "hello");
        if let Some(submission) = req.result.as_mut() {
            submission.duration_sec = 10_000;
        }
        let done = svc.finish_at(CANDIDATE, req, started.started_at).await.unwrap();
        assert_eq!(
            done.result.unwrap().typing.duration_sec,
            started.assessment.duration_sec
        );
    }

    #[tokio::test]
    async fn result_counters_match_session_counters() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();
        svc.record_event(CANDIDATE, event(&id, LockdownEventType::PasteAttempt))
            .await
            .unwrap();

        let prompt = started.assessment.prompt_text.clone();
        let done = svc.finish(CANDIDATE, finish_completed(&id, &prompt)).await.unwrap();
        let replay = svc.session_events(&id).await.unwrap();
        let stored = replay.session.result.expect("stored result");
        assert_eq!(stored.integrity, replay.session.integrity);
        assert_eq!(done.result.map(|r| r.integrity_score), Some(stored.integrity_score));
        assert_eq!(stored.integrity_score, 88);
    }

    #[tokio::test]
    async fn heartbeat_past_time_limit_terminates() {
        let svc = service();
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let id = started.session_id.clone();
        let policy = LockdownPolicy::default();
        let duration = i64::from(started.assessment.duration_sec);

        let on_time = started.started_at + Duration::seconds(duration + policy.overrun_grace_sec);
        let hb = svc
            .heartbeat_at(CANDIDATE, heartbeat_request(&id), on_time)
            .await
            .unwrap();
        assert_eq!(hb.status, SessionStatus::Active);

        let late = on_time + Duration::seconds(1);
        let hb = svc
            .heartbeat_at(CANDIDATE, heartbeat_request(&id), late)
            .await
            .unwrap();
        assert_eq!(hb.status, SessionStatus::Terminated);
        assert_eq!(hb.termination_reason.as_deref(), Some(TIME_LIMIT_REASON));

        let replay = svc.session_events(&id).await.unwrap();
        let last = replay.events.last().unwrap();
        assert_eq!(last.event_type, LockdownEventType::SessionTerminated);
        assert_eq!(last.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn sweeper_terminates_overrun_sessions_that_still_heartbeat() {
        let policy = LockdownPolicy {
            heartbeat_timeout_sec: 3600,
            ..LockdownPolicy::default()
        };
        let svc = LockdownService::new(Stores::in_memory(), policy.clone());
        let started = svc.start(CANDIDATE, start_request()).await.unwrap();
        let duration = i64::from(started.assessment.duration_sec);

        let within = started.started_at + Duration::seconds(duration + policy.overrun_grace_sec);
        assert_eq!(svc.sweep_stale_sessions(within).await.unwrap(), 0);

        let past = within + Duration::seconds(1);
        assert_eq!(svc.sweep_stale_sessions(past).await.unwrap(), 1);
        let replay = svc.session_events(&started.session_id).await.unwrap();
        assert_eq!(replay.session.status, SessionStatus::Terminated);
        assert_eq!(
            replay.session.termination_reason.as_deref(),
            Some(TIME_LIMIT_REASON)
        );
        assert_eq!(svc.sweep_stale_sessions(past).await.unwrap(), 0);
    }

}
