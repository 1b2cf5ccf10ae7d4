//! One delivery attempt: upstream call behind the shared breaker, classified.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::circuit::{CircuitBreaker, CircuitError};
use crate::jobs::PendingTriggerJob;
use crate::upstream::{DeliveryError, TriggerPayload, TriggerUpstream};

/// What a single attempt amounted to.
#[derive(Debug)]
pub enum Attempt {
    /// Upstream accepted the trigger.
    Delivered(JsonValue),
    /// Breaker open, timeout or transient upstream error. Try again later.
    Transient(CircuitError<DeliveryError>),
    /// Upstream rejected the trigger as invalid. Retrying cannot help.
    Permanent(DeliveryError),
}

/// Upstream delivery through the process-wide breaker.
///
/// Shared by the dispatcher (first attempt) and every tenant queue (retries),
/// so both paths feed the same breaker statistics.
#[derive(Clone)]
pub struct GuardedDelivery {
    breaker: Arc<CircuitBreaker>,
    upstream: Arc<dyn TriggerUpstream>,
}

impl GuardedDelivery {
    pub fn new(breaker: Arc<CircuitBreaker>, upstream: Arc<dyn TriggerUpstream>) -> Self {
        Self { breaker, upstream }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn attempt(&self, job: &PendingTriggerJob) -> Attempt {
        let payload = TriggerPayload::from_job(job);
        let tenant_id = job.tenant_id;
        let result = self
            .breaker
            .fire(|| self.upstream.deliver(tenant_id, &payload))
            .await;

        match result {
            Ok(response) => {
                debug!(tenant_id = %tenant_id, request_id = %job.id, key = %job.key, "trigger delivered");
                Attempt::Delivered(response)
            }
            Err(CircuitError::Filtered(err)) => {
                warn!(tenant_id = %tenant_id, request_id = %job.id, error = %err, "trigger rejected by upstream");
                Attempt::Permanent(err)
            }
            Err(err) => {
                debug!(tenant_id = %tenant_id, request_id = %job.id, error = %err, "trigger not delivered");
                Attempt::Transient(err)
            }
        }
    }
}

impl std::fmt::Debug for GuardedDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedDelivery")
            .field("breaker", &self.breaker.state())
            .finish_non_exhaustive()
    }
}
