//! Pending trigger storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use relay_core::{RequestId, TenantId};

use super::types::PendingTriggerJob;

/// Durable backlog of undelivered triggers, tenant-scoped.
///
/// Three operations only: insert one, delete by id, select all for a tenant.
#[async_trait]
pub trait PendingTriggerStore: Send + Sync {
    /// Insert a job. The store stamps `created_at`/`updated_at` and returns the
    /// stored record.
    async fn create(&self, job: &PendingTriggerJob) -> Result<PendingTriggerJob, StoreError>;

    /// Delete a job by id. Returns `false` when nothing matched.
    async fn remove(&self, tenant_id: TenantId, id: &RequestId) -> Result<bool, StoreError>;

    /// All pending jobs of a tenant, oldest first.
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingTriggerJob>, StoreError>;
}

/// Pending trigger store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("pending trigger already exists: {0}")]
    AlreadyExists(RequestId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt pending trigger row: {0}")]
    Decode(String),
}

#[async_trait]
impl<S> PendingTriggerStore for Arc<S>
where
    S: PendingTriggerStore + ?Sized,
{
    async fn create(&self, job: &PendingTriggerJob) -> Result<PendingTriggerJob, StoreError> {
        (**self).create(job).await
    }

    async fn remove(&self, tenant_id: TenantId, id: &RequestId) -> Result<bool, StoreError> {
        (**self).remove(tenant_id, id).await
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingTriggerJob>, StoreError> {
        (**self).list(tenant_id).await
    }
}

/// In-memory pending trigger store for tests/dev.
///
/// Outlives the queues that use it, so dropping every queue and building new
/// ones over the same store behaves like a process restart.
#[derive(Debug, Default)]
pub struct InMemoryPendingTriggerStore {
    rows: RwLock<HashMap<TenantId, HashMap<RequestId, PendingTriggerJob>>>,
    unavailable: AtomicBool,
}

impl InMemoryPendingTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows stored for a tenant.
    pub fn count(&self, tenant_id: TenantId) -> usize {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.get(&tenant_id).map_or(0, HashMap::len)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PendingTriggerStore for InMemoryPendingTriggerStore {
    async fn create(&self, job: &PendingTriggerJob) -> Result<PendingTriggerJob, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let tenant_rows = rows.entry(job.tenant_id).or_default();
        if tenant_rows.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }

        let now = Utc::now();
        let mut stored = job.clone();
        stored.created_at = now;
        stored.updated_at = now;
        // row_log_id has no column; mirror what a real store hands back.
        stored.row_log_id = None;
        tenant_rows.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn remove(&self, tenant_id: TenantId, id: &RequestId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get_mut(&tenant_id)
            .is_some_and(|tenant_rows| tenant_rows.remove(id).is_some()))
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingTriggerJob>, StoreError> {
        self.check_available()?;
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<_> = rows
            .get(&tenant_id)
            .map(|tenant_rows| tenant_rows.values().cloned().collect())
            .unwrap_or_default();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TriggerRequest;
    use serde_json::json;

    fn job(tenant: TenantId, id: &str) -> PendingTriggerJob {
        TriggerRequest::new("obj1.added", json!({"row": id}))
            .with_request_id(RequestId::parse(id).unwrap())
            .into_job(tenant)
            .unwrap()
    }

    #[tokio::test]
    async fn create_list_remove() {
        let store = InMemoryPendingTriggerStore::new();
        let tenant = TenantId::new();

        store.create(&job(tenant, "a")).await.unwrap();
        store.create(&job(tenant, "b")).await.unwrap();

        let listed = store.list(tenant).await.unwrap();
        assert_eq!(listed.len(), 2);

        assert!(store.remove(tenant, &RequestId::parse("a").unwrap()).await.unwrap());
        let listed = store.list(tenant).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = InMemoryPendingTriggerStore::new();
        let tenant = TenantId::new();

        store.create(&job(tenant, "a")).await.unwrap();
        let err = store.create(&job(tenant, "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn removing_unknown_id_is_not_an_error() {
        let store = InMemoryPendingTriggerStore::new();
        let removed = store
            .remove(TenantId::new(), &RequestId::parse("missing").unwrap())
            .await
            .unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = InMemoryPendingTriggerStore::new();
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        store.create(&job(t1, "a")).await.unwrap();
        // Same id under another tenant is a different row.
        store.create(&job(t2, "a")).await.unwrap();

        assert!(store.remove(t2, &RequestId::parse("a").unwrap()).await.unwrap());
        assert_eq!(store.count(t1), 1);
        assert_eq!(store.count(t2), 0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = InMemoryPendingTriggerStore::new();
        let tenant = TenantId::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.create(&job(tenant, "a")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.list(tenant).await.is_err());

        store.set_unavailable(false);
        assert!(store.list(tenant).await.unwrap().is_empty());
    }
}
