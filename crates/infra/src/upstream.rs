//! Upstream process-manager boundary.
//!
//! The consumer contract: `deliver(key, data, requestID, rowLogID)` is
//! idempotent per `requestID`, and structurally invalid triggers are rejected
//! with the `EINVALIDINPUTS` code. Everything else is treated as transient.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use relay_core::TenantId;

use crate::circuit::FailureClass;
use crate::jobs::PendingTriggerJob;

/// Error code upstream uses for structurally invalid triggers.
pub const INVALID_INPUTS_CODE: &str = "EINVALIDINPUTS";

/// Wire body of a trigger delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub key: String,
    pub data: JsonValue,
    #[serde(rename = "requestID")]
    pub request_id: String,
    #[serde(rename = "rowLogID", default, skip_serializing_if = "Option::is_none")]
    pub row_log_id: Option<String>,
}

impl TriggerPayload {
    pub fn from_job(job: &PendingTriggerJob) -> Self {
        Self {
            key: job.key.clone(),
            data: job.data.clone(),
            request_id: job.id.to_string(),
            row_log_id: job.row_log_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("EINVALIDINPUTS: {0}")]
    InvalidInputs(String),
    #[error("upstream timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("upstream error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("unexpected upstream response: {0}")]
    Protocol(String),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::InvalidInputs(_) => INVALID_INPUTS_CODE,
            DeliveryError::Timeout => "ETIMEDOUT",
            DeliveryError::Connection(_) => "ECONNECTION",
            DeliveryError::Server { .. } => "ESERVER",
            DeliveryError::Protocol(_) => "EPROTOCOL",
        }
    }

    /// Retrying a permanent failure can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::InvalidInputs(_))
    }
}

impl FailureClass for DeliveryError {
    fn is_filtered(&self) -> bool {
        self.is_permanent()
    }
}

/// The process-manager trigger call.
#[async_trait]
pub trait TriggerUpstream: Send + Sync {
    async fn deliver(
        &self,
        tenant_id: TenantId,
        payload: &TriggerPayload,
    ) -> Result<JsonValue, DeliveryError>;
}

#[async_trait]
impl<U> TriggerUpstream for Arc<U>
where
    U: TriggerUpstream + ?Sized,
{
    async fn deliver(
        &self,
        tenant_id: TenantId,
        payload: &TriggerPayload,
    ) -> Result<JsonValue, DeliveryError> {
        (**self).deliver(tenant_id, payload).await
    }
}

/// Error body shape returned by the process manager.
#[derive(Debug, Default, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for `POST {base_url}/process_manager/trigger`.
#[derive(Debug, Clone)]
pub struct HttpTriggerUpstream {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTriggerUpstream {
    pub const TENANT_HEADER: &'static str = "X-Tenant-ID";

    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            client,
            endpoint: format!("{base}/process_manager/trigger"),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TriggerUpstream for HttpTriggerUpstream {
    async fn deliver(
        &self,
        tenant_id: TenantId,
        payload: &TriggerPayload,
    ) -> Result<JsonValue, DeliveryError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(Self::TENANT_HEADER, tenant_id.to_string())
            .json(payload)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        debug!(
            tenant_id = %tenant_id,
            request_id = %payload.request_id,
            status,
            "process manager responded"
        );
        classify_response(status, &body)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else if err.is_decode() {
        DeliveryError::Protocol(err.to_string())
    } else {
        DeliveryError::Connection(err.to_string())
    }
}

/// Turn an HTTP status and body into a delivery result.
pub fn classify_response(status: u16, body: &str) -> Result<JsonValue, DeliveryError> {
    if (200..300).contains(&status) {
        if body.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        return serde_json::from_str(body).map_err(|e| DeliveryError::Protocol(e.to_string()));
    }

    let parsed: UpstreamErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| body.chars().take(512).collect());

    if parsed.code.as_deref() == Some(INVALID_INPUTS_CODE) || status == 422 {
        return Err(DeliveryError::InvalidInputs(message));
    }
    Err(DeliveryError::Server { status, message })
}
