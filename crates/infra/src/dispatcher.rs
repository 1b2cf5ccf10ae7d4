//! Trigger dispatch: the entry point write paths call after a row changes.
//!
//! ## Flow
//!
//! ```text
//! TriggerRequest
//!   ↓
//! 1. Build the job (assign a request id if the caller gave none)
//!   ↓
//! 2. Attempt delivery through the shared circuit breaker
//!   ├─ delivered  → done
//!   ├─ transient  → persist into the tenant's retry queue (fallback)
//!   └─ invalid    → alert operator, drop any persisted copy from the tenant's queue
//! ```
//!
//! Delivery is at-least-once: a job that reached upstream but whose queue
//! removal was lost gets delivered again, and the consumer dedupes by request
//! id. Nothing but request validation is ever returned as an error; delivery
//! and persistence failures end up with the operator notifier.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::{error, info, instrument};

use relay_core::{DomainError, RequestId, TenantId};

use crate::delivery::{Attempt, GuardedDelivery};
use crate::jobs::{PendingTriggerJob, TriggerRequest};
use crate::notify::{AlertKind, OperatorAlert, OperatorNotifier};
use crate::registry::TenantQueueRegistry;

/// How a registered trigger was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Upstream accepted it on the first attempt.
    Delivered(JsonValue),
    /// Not delivered yet; persisted in the tenant's retry queue.
    Queued,
    /// Upstream rejected it as invalid; reported and discarded.
    Dropped,
    /// Could not be delivered or persisted; reported and discarded.
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerReceipt {
    pub request_id: RequestId,
    pub outcome: TriggerOutcome,
}

impl TriggerReceipt {
    /// `true` when the retry queue took over.
    pub fn used_fallback(&self) -> bool {
        self.outcome == TriggerOutcome::Queued
    }
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    delivery: GuardedDelivery,
    registry: Arc<TenantQueueRegistry>,
    notifier: Arc<dyn OperatorNotifier>,
}

impl TriggerDispatcher {
    pub fn new(
        delivery: GuardedDelivery,
        registry: Arc<TenantQueueRegistry>,
        notifier: Arc<dyn OperatorNotifier>,
    ) -> Self {
        Self {
            delivery,
            registry,
            notifier,
        }
    }

    /// Deliver a trigger now or queue it for retry.
    ///
    /// Returns after upstream accepted the trigger or the queue persisted it,
    /// so the wait is bounded by the breaker timeout plus one store write.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, key = %request.key))]
    pub async fn register_trigger(
        &self,
        tenant_id: TenantId,
        request: TriggerRequest,
    ) -> Result<TriggerReceipt, DomainError> {
        let job = request.into_job(tenant_id)?;
        let request_id = job.id.clone();

        let outcome = match self.delivery.attempt(&job).await {
            Attempt::Delivered(response) => TriggerOutcome::Delivered(response),
            Attempt::Transient(reason) => {
                info!(tenant_id = %tenant_id, request_id = %request_id, reason = %reason, "trigger delivery deferred");
                self.fallback(job).await
            }
            Attempt::Permanent(err) => {
                self.notifier.alert(
                    OperatorAlert::new(AlertKind::InvalidInputs, "process trigger rejected as invalid", &err)
                        .for_tenant(tenant_id)
                        .for_request(request_id.clone())
                        .with_inputs(inputs(&job)),
                );
                self.discard_queued(tenant_id, &request_id).await;
                TriggerOutcome::Dropped
            }
        };

        Ok(TriggerReceipt { request_id, outcome })
    }

    async fn fallback(&self, job: PendingTriggerJob) -> TriggerOutcome {
        let tenant_id = job.tenant_id;
        let queued = match self.registry.get_or_create(tenant_id).await {
            Ok(queue) => queue.add(job.clone()).await,
            Err(e) => Err(e),
        };

        match queued {
            Ok(()) => TriggerOutcome::Queued,
            Err(e) => {
                error!(tenant_id = %tenant_id, request_id = %job.id, error = %e, "failed trigger could not be queued");
                self.notifier.alert(
                    OperatorAlert::new(AlertKind::PersistenceFailure, "failed process trigger could not be queued", e)
                        .for_tenant(tenant_id)
                        .for_request(job.id.clone())
                        .with_inputs(inputs(&job)),
                );
                TriggerOutcome::Lost
            }
        }
    }

    /// Remove a persisted copy of an invalid trigger.
    ///
    /// Goes through `get_or_create` so a tenant whose queue never started
    /// still has the row deleted instead of swept and reported again later.
    async fn discard_queued(&self, tenant_id: TenantId, request_id: &RequestId) {
        let removed = match self.registry.get_or_create(tenant_id).await {
            Ok(queue) => queue.remove(request_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            self.notifier.alert(
                OperatorAlert::new(AlertKind::QueueCleanup, "invalid trigger could not be removed", e)
                    .for_tenant(tenant_id)
                    .for_request(request_id.clone()),
            );
        }
    }
}

impl std::fmt::Debug for TriggerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDispatcher")
            .field("delivery", &self.delivery)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn inputs(job: &PendingTriggerJob) -> JsonValue {
    json!({ "key": job.key, "data": job.data, "requestID": job.id })
}
