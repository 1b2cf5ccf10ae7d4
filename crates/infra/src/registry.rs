//! Tenant queue registry.
//!
//! Owns one [`TenantTriggerQueue`] per tenant for the life of the process.
//! Queues are created lazily on first use, or eagerly for every known tenant
//! at bootstrap. Creation is single-flight per tenant: concurrent callers for
//! the same uninitialized tenant wait on one initialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use relay_core::TenantId;

use crate::jobs::StoreError;
use crate::notify::{AlertKind, OperatorAlert};
use crate::queue::{QueueContext, TenantTriggerQueue};
use crate::tenants::{DirectoryError, TenantDirectory};

type QueueSlot = Arc<OnceCell<Arc<TenantTriggerQueue>>>;

/// Queues hydrating from storage at the same time during bootstrap.
const BOOTSTRAP_CONCURRENCY: usize = 16;

/// Result of [`TenantQueueRegistry::bootstrap`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub started: Vec<TenantId>,
    pub failed: Vec<TenantId>,
}

pub struct TenantQueueRegistry {
    ctx: QueueContext,
    slots: Mutex<HashMap<TenantId, QueueSlot>>,
    cancel: CancellationToken,
}

impl TenantQueueRegistry {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            slots: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The tenant's queue, creating and initializing it if needed.
    ///
    /// A failed initialization is not cached; the next call tries again.
    pub async fn get_or_create(&self, tenant_id: TenantId) -> Result<Arc<TenantTriggerQueue>, StoreError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(tenant_id).or_default())
        };

        slot.get_or_try_init(|| async {
            let queue = Arc::new(TenantTriggerQueue::new(
                tenant_id,
                self.ctx.clone(),
                self.cancel.child_token(),
            ));
            queue.init().await?;
            Ok::<_, StoreError>(queue)
        })
        .await
        .cloned()
    }

    /// Existing queue for a tenant, without creating one.
    pub fn queue(&self, tenant_id: TenantId) -> Option<Arc<TenantTriggerQueue>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Tenants with an initialized queue.
    pub fn tenants(&self) -> Vec<TenantId> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tenants: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(tenant_id, _)| *tenant_id)
            .collect();
        tenants.sort();
        tenants
    }

    /// Start a queue for every tenant the directory knows about.
    ///
    /// Queues start concurrently, at most [`BOOTSTRAP_CONCURRENCY`] at a time;
    /// the report keeps directory order. A tenant whose queue fails to start
    /// is reported to the operator and skipped; only an unreachable directory
    /// fails the bootstrap.
    #[instrument(skip_all, err)]
    pub async fn bootstrap(
        self: &Arc<Self>,
        directory: &dyn TenantDirectory,
    ) -> Result<BootstrapReport, DirectoryError> {
        let tenants = directory.list_tenants().await?;

        let permits = Arc::new(Semaphore::new(BOOTSTRAP_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for (index, tenant_id) in tenants.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let registry = Arc::clone(self);
            tasks.spawn(async move {
                let started = registry.get_or_create(tenant_id).await;
                drop(permit);
                (index, tenant_id, started)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "tenant bootstrap task failed"),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut report = BootstrapReport::default();
        for (_, tenant_id, started) in results {
            match started {
                Ok(_) => report.started.push(tenant_id),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "tenant trigger queue failed to start");
                    self.ctx.notifier.alert(
                        OperatorAlert::new(AlertKind::QueueStartup, "tenant trigger queue failed to start", e)
                            .for_tenant(tenant_id),
                    );
                    report.failed.push(tenant_id);
                }
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "tenant trigger queues bootstrapped"
        );
        Ok(report)
    }

    /// Stop every sweeper and wait for in-progress sweeps to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let queues: Vec<_> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.values().filter_map(|slot| slot.get().cloned()).collect()
        };
        for queue in &queues {
            queue.shutdown().await;
        }
        info!(queues = queues.len(), "tenant trigger queues stopped");
    }
}

impl std::fmt::Debug for TenantQueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantQueueRegistry")
            .field("tenants", &self.tenants())
            .finish_non_exhaustive()
    }
}
