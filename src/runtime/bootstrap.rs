//! Launch helper: probe, local policy check, start request, and the bootstrap
//! record the runtime reads back after navigation or reload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dto::lockdown_dto::{StartRequest, StartResponse};
use crate::runtime::probe::{BrowserSnapshot, EnvironmentProbe, ProbeTrigger};
use crate::runtime::storage::{read_json, write_json, ClientStorage, StorageArea};
use crate::runtime::transport::{LockdownTransport, TransportError};
use crate::services::policy_service;

pub const BOOTSTRAP_KEY: &str = "lockdown.bootstrap";

/// Local mirror of the started session. Rendering and reload recovery only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub session_id: String,
    pub assessment_id: String,
    pub assessment_name: String,
    pub device_id: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub duration_sec: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub policy_warnings: Vec<String>,
}

impl Bootstrap {
    pub fn from_start(response: StartResponse, device_id: &str) -> Self {
        Self {
            session_id: response.session_id,
            assessment_id: response.assessment.id,
            assessment_name: response.assessment.name,
            device_id: device_id.to_string(),
            prompt_id: response.assessment.prompt_id,
            prompt_text: response.assessment.prompt_text,
            duration_sec: response.assessment.duration_sec,
            started_at: response.started_at,
            policy_warnings: response.policy_warnings,
        }
    }

    pub fn load(storage: &dyn ClientStorage) -> Option<Self> {
        read_json(storage, StorageArea::Session, BOOTSTRAP_KEY)
    }

    pub fn save(&self, storage: &dyn ClientStorage) -> bool {
        write_json(storage, StorageArea::Session, BOOTSTRAP_KEY, self)
    }

    pub fn clear(storage: &dyn ClientStorage) {
        storage.remove(StorageArea::Session, BOOTSTRAP_KEY);
    }

    pub fn matches(&self, session_id: &str, assessment_id: &str) -> bool {
        self.session_id == session_id && self.assessment_id == assessment_id
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaunchError {
    #[error("the assessment rules must be accepted first")]
    NotAcknowledged,

    #[error("environment blocked: {}", reasons.join("; "))]
    Blocked {
        reasons: Vec<String>,
        warnings: Vec<String>,
    },

    #[error("could not start the assessment: {0}")]
    Transport(TransportError),

    #[error("could not store the session context in this browser")]
    Storage,
}

/// Launches a secure session. A locally blocked environment never reaches the
/// server; a server-side policy rejection is reported the same way.
pub async fn launch(
    transport: &dyn LockdownTransport,
    storage: &dyn ClientStorage,
    snapshot: &BrowserSnapshot,
    assessment_id: &str,
    acknowledged: bool,
) -> Result<Bootstrap, LaunchError> {
    if !acknowledged {
        return Err(LaunchError::NotAcknowledged);
    }

    let checks = {
        let mut probe = EnvironmentProbe::new(storage);
        probe
            .on_trigger(ProbeTrigger::Mount, snapshot, Utc::now())
            .cloned()
            .unwrap_or_default()
    };
    let decision = policy_service::evaluate(&checks);
    if decision.is_blocked() {
        tracing::warn!(reasons = ?decision.blocking_reasons, "Launch blocked by local environment check");
        return Err(LaunchError::Blocked {
            reasons: decision.blocking_reasons,
            warnings: decision.warnings,
        });
    }

    let device_id = checks.fingerprint.clone().unwrap_or_default();
    let response = transport
        .start(StartRequest {
            assessment_id: assessment_id.to_string(),
            device_id: device_id.clone(),
            environment: checks,
            acknowledged,
        })
        .await
        .map_err(|e| match e {
            TransportError::PolicyRejected { reasons, warnings } => {
                LaunchError::Blocked { reasons, warnings }
            }
            other => LaunchError::Transport(other),
        })?;

    let bootstrap = Bootstrap::from_start(response, &device_id);
    if !bootstrap.save(storage) {
        return Err(LaunchError::Storage);
    }
    tracing::info!(session_id = %bootstrap.session_id, "Secure session launched");
    Ok(bootstrap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::lockdown_dto::AssessmentInfo;
    use crate::runtime::storage::MemoryStorage;
    use crate::runtime::transport::MockLockdownTransport;

    fn desktop() -> BrowserSnapshot {
        BrowserSnapshot {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) Safari/605.1.15".into(),
            platform: "MacIntel".into(),
            language: "en-GB".into(),
            timezone: "Europe/London".into(),
            viewport_width: 1512,
            viewport_height: 860,
            screen_width: 1512,
            screen_height: 982,
            hardware_concurrency: Some(10),
            gpu_renderer: Some("Apple M2".into()),
            fullscreen_enabled: true,
            ..Default::default()
        }
    }

    fn started(session_id: &str) -> StartResponse {
        StartResponse {
            session_id: session_id.into(),
            assessment: AssessmentInfo {
                id: "typing-speed".into(),
                name: "Typing Speed".into(),
                prompt_id: "p1".into(),
                prompt_text: "hello world".into(),
                duration_sec: 60,
            },
            started_at: Utc::now(),
            policy_warnings: vec![],
        }
    }

    #[tokio::test]
    async fn successful_launch_writes_bootstrap() {
        let storage = MemoryStorage::new();
        let mut transport = MockLockdownTransport::new();
        transport
            .expect_start()
            .withf(|req| req.acknowledged && req.device_id.starts_with("fp-"))
            .times(1)
            .returning(|_| Ok(started("lds_abc")));

        let bootstrap = tokio_test::assert_ok!(
            launch(&transport, &storage, &desktop(), "typing-speed", true).await
        );
        assert_eq!(Bootstrap::load(&storage), Some(bootstrap.clone()));
        assert!(bootstrap.matches("lds_abc", "typing-speed"));
    }

    #[tokio::test]
    async fn blocked_environment_never_calls_the_server() {
        let storage = MemoryStorage::new();
        let transport = MockLockdownTransport::new();
        let mut tablet = desktop();
        tablet.max_touch_points = 10;

        let err = launch(&transport, &storage, &tablet, "typing-speed", true)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Blocked { ref reasons, .. } if reasons.len() == 1));
        assert!(Bootstrap::load(&storage).is_none());
    }

    #[tokio::test]
    async fn server_policy_rejection_is_structured() {
        let storage = MemoryStorage::new();
        let mut transport = MockLockdownTransport::new();
        transport.expect_start().returning(|_| {
            Err(TransportError::PolicyRejected {
                reasons: vec!["gpu".into()],
                warnings: vec![],
            })
        });
        let err = launch(&transport, &storage, &desktop(), "typing-speed", true)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LaunchError::Blocked {
                reasons: vec!["gpu".into()],
                warnings: vec![]
            }
        );
    }

    #[tokio::test]
    async fn acknowledgement_is_required() {
        let storage = MemoryStorage::new();
        let transport = MockLockdownTransport::new();
        tokio_test::assert_err!(launch(&transport, &storage, &desktop(), "typing-speed", false).await);
    }
}
