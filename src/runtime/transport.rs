use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::dto::lockdown_dto::{
    EventRequest, EventResponse, FinishRequest, FinishResponse, HeartbeatRequest,
    HeartbeatResponse, StartRequest, StartResponse,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("environment blocked: {}", reasons.join("; "))]
    PolicyRejected {
        reasons: Vec<String>,
        warnings: Vec<String>,
    },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// The four lockdown endpoints as seen from the client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockdownTransport: Send + Sync {
    async fn start(&self, req: StartRequest) -> Result<StartResponse, TransportError>;

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, TransportError>;

    async fn post_event(&self, req: EventRequest) -> Result<EventResponse, TransportError>;

    async fn finish(&self, req: FinishRequest) -> Result<FinishResponse, TransportError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    restriction: Option<Restriction>,
}

#[derive(Deserialize)]
struct Restriction {
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: url::Url,
    token: String,
    origin: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: &str, origin: &str) -> Result<Self, TransportError> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| TransportError::Decode(format!("invalid base url: {}", e)))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            origin: origin.to_string(),
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header(header::ORIGIN, &self.origin)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_from_body(status, &text))
    }
}

fn error_from_body(status: StatusCode, text: &str) -> TransportError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(ErrorBody {
            restriction: Some(r),
            ..
        }) if status == StatusCode::PRECONDITION_FAILED => TransportError::PolicyRejected {
            reasons: r.reasons,
            warnings: r.warnings,
        },
        Ok(body) => TransportError::Rejected {
            status: status.as_u16(),
            reason: body.error,
        },
        Err(_) => TransportError::Rejected {
            status: status.as_u16(),
            reason: status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        },
    }
}

#[async_trait]
impl LockdownTransport for HttpTransport {
    async fn start(&self, req: StartRequest) -> Result<StartResponse, TransportError> {
        self.post("/api/lockdown/start", &req).await
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        self.post("/api/lockdown/heartbeat", &req).await
    }

    async fn post_event(&self, req: EventRequest) -> Result<EventResponse, TransportError> {
        self.post("/api/lockdown/event", &req).await
    }

    async fn finish(&self, req: FinishRequest) -> Result<FinishResponse, TransportError> {
        self.post("/api/lockdown/finish", &req).await
    }
}
