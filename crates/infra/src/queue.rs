//! Per-tenant durable retry queue.
//!
//! A job lives in the pending-trigger store, and in this queue's memory, from
//! the moment a delivery fails until an attempt succeeds or upstream rejects it
//! as invalid. A background sweeper re-attempts every pending job on a fixed
//! interval with bounded parallelism.
//!
//! `add` and `remove` are serialized per tenant by an async mutex held across
//! the store write, so memory and storage never disagree about a job that the
//! queue itself created or deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::{RequestId, TenantId};

use crate::delivery::{Attempt, GuardedDelivery};
use crate::jobs::{PendingTriggerJob, PendingTriggerStore, StoreError};
use crate::notify::{AlertKind, OperatorAlert, OperatorNotifier};

/// Everything a tenant queue needs besides its tenant id.
#[derive(Clone)]
pub struct QueueContext {
    pub store: Arc<dyn PendingTriggerStore>,
    pub delivery: GuardedDelivery,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub retry_interval: Duration,
    pub sweep_concurrency: usize,
}

/// Tally of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retained: usize,
    pub dropped: usize,
}

enum RetryResult {
    Delivered,
    Retained,
    Dropped,
}

pub struct TenantTriggerQueue {
    tenant_id: TenantId,
    ctx: QueueContext,
    pending: Mutex<HashMap<RequestId, PendingTriggerJob>>,
    cancel: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl TenantTriggerQueue {
    /// Create an empty queue. Nothing is loaded or scheduled until
    /// [`init`](Self::init) or the first [`add`](Self::add).
    pub fn new(tenant_id: TenantId, ctx: QueueContext, cancel: CancellationToken) -> Self {
        Self {
            tenant_id,
            ctx,
            pending: Mutex::new(HashMap::new()),
            cancel,
            sweeper: StdMutex::new(None),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Hydrate memory from storage and start the sweeper.
    #[instrument(skip(self), fields(tenant_id = %self.tenant_id), err)]
    pub async fn init(self: &Arc<Self>) -> Result<(), StoreError> {
        let stored = self.list().await?;
        let loaded = stored.len();
        {
            let mut pending = self.pending.lock().await;
            for job in stored {
                pending.entry(job.id.clone()).or_insert(job);
            }
        }
        self.ensure_sweeper();
        info!(tenant_id = %self.tenant_id, loaded, "tenant trigger queue started");
        Ok(())
    }

    /// Persist and track a job; idempotent per job id.
    pub async fn add(self: &Arc<Self>, job: PendingTriggerJob) -> Result<(), StoreError> {
        if job.tenant_id != self.tenant_id {
            return Err(StoreError::Storage(format!(
                "job {} belongs to tenant {}, not {}",
                job.id, job.tenant_id, self.tenant_id
            )));
        }

        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&job.id) {
                debug!(tenant_id = %self.tenant_id, request_id = %job.id, "trigger already queued");
                return Ok(());
            }

            let stored = match self.ctx.store.create(&job).await {
                Ok(stored) => stored,
                // Row left over from an earlier process; track what we have.
                Err(StoreError::AlreadyExists(_)) => job,
                Err(e) => return Err(e),
            };
            info!(tenant_id = %self.tenant_id, request_id = %stored.id, key = %stored.key, "trigger queued for retry");
            pending.insert(stored.id.clone(), stored);
        }

        self.ensure_sweeper();
        Ok(())
    }

    /// Delete a job from storage and memory.
    ///
    /// Returns whether anything was removed; an unknown id is not an error.
    /// When the store fails the job stays tracked and will be retried.
    pub async fn remove(&self, id: &RequestId) -> Result<bool, StoreError> {
        let mut pending = self.pending.lock().await;
        let removed_stored = self.ctx.store.remove(self.tenant_id, id).await?;
        let removed_tracked = pending.remove(id).is_some();
        if removed_stored || removed_tracked {
            debug!(tenant_id = %self.tenant_id, request_id = %id, "trigger removed from queue");
        }
        Ok(removed_stored || removed_tracked)
    }

    /// Every job persisted for this tenant, oldest first.
    pub async fn list(&self) -> Result<Vec<PendingTriggerJob>, StoreError> {
        self.ctx.store.list(self.tenant_id).await
    }

    /// Snapshot of the jobs tracked in memory, oldest first.
    pub async fn pending(&self) -> Vec<PendingTriggerJob> {
        let mut jobs: Vec<_> = self.pending.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn contains(&self, id: &RequestId) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    /// Re-attempt every pending job once.
    pub async fn sweep_once(self: &Arc<Self>) -> SweepReport {
        let jobs = self.pending().await;
        let mut report = SweepReport {
            attempted: jobs.len(),
            ..SweepReport::default()
        };
        if jobs.is_empty() {
            return report;
        }

        debug!(tenant_id = %self.tenant_id, pending = jobs.len(), "sweeping pending triggers");
        let permits = Arc::new(Semaphore::new(self.ctx.sweep_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for job in jobs {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let queue = Arc::clone(self);
            tasks.spawn(async move {
                let result = queue.retry(job).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RetryResult::Delivered) => report.delivered += 1,
                Ok(RetryResult::Retained) => report.retained += 1,
                Ok(RetryResult::Dropped) => report.dropped += 1,
                Err(e) => {
                    warn!(tenant_id = %self.tenant_id, error = %e, "retry task failed");
                    report.retained += 1;
                }
            }
        }

        if report.delivered > 0 || report.dropped > 0 {
            info!(
                tenant_id = %self.tenant_id,
                delivered = report.delivered,
                dropped = report.dropped,
                retained = report.retained,
                "sweep finished"
            );
        }
        report
    }

    /// Stop the sweeper and wait for an in-progress sweep to finish.
    ///
    /// Persisted jobs stay in storage for the next process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(tenant_id = %self.tenant_id, error = %e, "sweeper task ended abnormally");
            }
        }
        debug!(tenant_id = %self.tenant_id, "tenant trigger queue stopped");
    }

    async fn retry(&self, job: PendingTriggerJob) -> RetryResult {
        match self.ctx.delivery.attempt(&job).await {
            Attempt::Delivered(_) => match self.remove(&job.id).await {
                Ok(_) => RetryResult::Delivered,
                Err(e) => {
                    // Redelivered next tick; the consumer dedupes by id.
                    warn!(tenant_id = %self.tenant_id, request_id = %job.id, error = %e, "delivered trigger could not be removed");
                    RetryResult::Retained
                }
            },
            Attempt::Transient(_) => RetryResult::Retained,
            Attempt::Permanent(err) => {
                self.ctx.notifier.alert(
                    OperatorAlert::new(AlertKind::InvalidInputs, "queued trigger rejected by process manager", &err)
                        .for_tenant(self.tenant_id)
                        .for_request(job.id.clone())
                        .with_inputs(serde_json::json!({ "key": job.key, "data": job.data })),
                );
                if let Err(e) = self.remove(&job.id).await {
                    self.ctx.notifier.alert(
                        OperatorAlert::new(AlertKind::QueueCleanup, "invalid trigger could not be removed", e)
                            .for_tenant(self.tenant_id)
                            .for_request(job.id.clone()),
                    );
                }
                RetryResult::Dropped
            }
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        // The schedule starts now, not when the runtime first polls the task.
        let first = Instant::now() + self.ctx.retry_interval;
        *sweeper = Some(tokio::spawn(run_sweeper(
            Arc::downgrade(self),
            self.cancel.clone(),
            first,
            self.ctx.retry_interval,
        )));
    }
}

impl std::fmt::Debug for TenantTriggerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTriggerQueue")
            .field("tenant_id", &self.tenant_id)
            .field("retry_interval", &self.ctx.retry_interval)
            .finish_non_exhaustive()
    }
}

async fn run_sweeper(
    queue: Weak<TenantTriggerQueue>,
    cancel: CancellationToken,
    first: Instant,
    every: Duration,
) {
    let mut ticker = tokio::time::interval_at(first, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(queue) = queue.upgrade() else { break };
                queue.sweep_once().await;
            }
        }
    }
}
