use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use relay_core::{DomainError, RequestId};
use relay_infra::jobs::{PendingTriggerJob, TriggerRequest};
use relay_infra::{TriggerOutcome, TriggerReceipt};

#[derive(Debug, Deserialize)]
pub struct RegisterTriggerRequest {
    pub key: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(rename = "requestID", default)]
    pub request_id: Option<String>,
    #[serde(rename = "rowLogID", default)]
    pub row_log_id: Option<String>,
    #[serde(default)]
    pub user: JsonValue,
}

impl RegisterTriggerRequest {
    pub fn into_trigger(self) -> Result<TriggerRequest, DomainError> {
        let mut trigger = TriggerRequest::new(self.key, self.data).with_user(self.user);
        if let Some(id) = self.request_id {
            trigger = trigger.with_request_id(RequestId::parse(id)?);
        }
        if let Some(row_log_id) = self.row_log_id {
            trigger = trigger.with_row_log_id(row_log_id);
        }
        Ok(trigger)
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerReceiptResponse {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonValue>,
}

impl From<TriggerReceipt> for TriggerReceiptResponse {
    fn from(receipt: TriggerReceipt) -> Self {
        let (outcome, response) = match receipt.outcome {
            TriggerOutcome::Delivered(body) => ("delivered", Some(body)),
            TriggerOutcome::Queued => ("queued", None),
            TriggerOutcome::Dropped => ("dropped", None),
            TriggerOutcome::Lost => ("lost", None),
        };
        Self {
            request_id: receipt.request_id.to_string(),
            outcome,
            response,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingTriggerResponse {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub key: String,
    pub data: JsonValue,
    pub created_at: String,
}

impl From<PendingTriggerJob> for PendingTriggerResponse {
    fn from(job: PendingTriggerJob) -> Self {
        Self {
            request_id: job.id.to_string(),
            key: job.key,
            data: job.data,
            created_at: job.created_at.to_rfc3339(),
        }
    }
}
