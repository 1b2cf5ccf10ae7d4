//! Pending trigger job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use relay_core::{DomainError, DomainResult, RequestId, TenantId};

/// A trigger as submitted by the write path that produced it.
///
/// `key` names the event (`"<objectID>.added"`, `".updated"`, `".deleted"`),
/// `data` describes the changed row and `user` carries the submitting
/// user/context for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub key: String,
    pub data: JsonValue,
    /// Correlation id; assigned by the dispatcher when absent.
    pub request_id: Option<RequestId>,
    /// Row-log entry that produced this trigger, forwarded on first delivery.
    pub row_log_id: Option<String>,
    pub user: JsonValue,
}

impl TriggerRequest {
    pub fn new(key: impl Into<String>, data: JsonValue) -> Self {
        Self {
            key: key.into(),
            data,
            request_id: None,
            row_log_id: None,
            user: JsonValue::Null,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_row_log_id(mut self, row_log_id: impl Into<String>) -> Self {
        self.row_log_id = Some(row_log_id.into());
        self
    }

    pub fn with_user(mut self, user: JsonValue) -> Self {
        self.user = user;
        self
    }

    /// Build the job for `tenant_id`, assigning a fresh correlation id if needed.
    pub fn into_job(self, tenant_id: TenantId) -> DomainResult<PendingTriggerJob> {
        if self.key.trim().is_empty() {
            return Err(DomainError::validation("trigger key must not be empty"));
        }
        let now = Utc::now();
        Ok(PendingTriggerJob {
            id: self.request_id.unwrap_or_default(),
            tenant_id,
            key: self.key,
            data: self.data,
            user: self.user,
            row_log_id: self.row_log_id,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A unit of retryable delivery work.
///
/// Exists in the pending-trigger store exactly while it is not known to have
/// been accepted upstream. Never mutated apart from store timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTriggerJob {
    /// Correlation id (`uuid` column); the consumer's deduplication key.
    pub id: RequestId,
    pub tenant_id: TenantId,
    pub key: String,
    pub data: JsonValue,
    /// Submitting user/context metadata.
    pub user: JsonValue,
    /// Not persisted: jobs rehydrated from storage carry `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_log_id: Option<String>,
    /// Set by the store on insert.
    pub created_at: DateTime<Utc>,
    /// Set by the store on insert.
    pub updated_at: DateTime<Utc>,
}
