//! Operator alert channel.
//!
//! Failures that never travel back to the write path (invalid inputs, lost
//! jobs, bootstrap problems) are reported here instead.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::error;

use relay_core::{RequestId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Upstream rejected the trigger as structurally invalid.
    InvalidInputs,
    /// A failed trigger could not be queued; it is lost.
    PersistenceFailure,
    /// A permanently failed trigger could not be removed from its queue.
    QueueCleanup,
    /// A tenant queue could not be started.
    QueueStartup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    pub context: String,
    pub error: String,
    pub tenant_id: Option<TenantId>,
    pub request_id: Option<RequestId>,
    /// Offending inputs, when there are any.
    pub inputs: JsonValue,
}

impl OperatorAlert {
    pub fn new(kind: AlertKind, context: impl Into<String>, error: impl ToString) -> Self {
        Self {
            kind,
            context: context.into(),
            error: error.to_string(),
            tenant_id: None,
            request_id: None,
            inputs: JsonValue::Null,
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn for_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_inputs(mut self, inputs: JsonValue) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Sink for operator alerts. Must not block.
pub trait OperatorNotifier: Send + Sync {
    fn alert(&self, alert: OperatorAlert);
}

impl<N> OperatorNotifier for Arc<N>
where
    N: OperatorNotifier + ?Sized,
{
    fn alert(&self, alert: OperatorAlert) {
        (**self).alert(alert)
    }
}

/// Emits alerts as `error`-level tracing events (picked up by log alerting).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl OperatorNotifier for TracingNotifier {
    fn alert(&self, alert: OperatorAlert) {
        error!(
            alert = ?alert.kind,
            tenant_id = ?alert.tenant_id.map(|t| t.to_string()),
            request_id = ?alert.request_id.as_ref().map(RequestId::as_str),
            inputs = %alert.inputs,
            error = %alert.error,
            "{}",
            alert.context
        );
    }
}

/// Keeps every alert in memory (tests/dev).
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }
}

impl OperatorNotifier for CollectingNotifier {
    fn alert(&self, alert: OperatorAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
