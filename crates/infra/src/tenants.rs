//! Tenant directory: which tenants exist, consulted once at bootstrap.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use relay_core::TenantId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("tenant directory unavailable: {0}")]
    Unavailable(String),
    #[error("invalid tenant row: {0}")]
    InvalidRow(String),
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<TenantId>, DirectoryError>;
}

#[async_trait]
impl<D> TenantDirectory for Arc<D>
where
    D: TenantDirectory + ?Sized,
{
    async fn list_tenants(&self) -> Result<Vec<TenantId>, DirectoryError> {
        (**self).list_tenants().await
    }
}

/// Fixed tenant list for tests/dev.
#[derive(Debug, Default)]
pub struct StaticTenantDirectory {
    tenants: RwLock<Vec<TenantId>>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: impl IntoIterator<Item = TenantId>) -> Self {
        Self {
            tenants: RwLock::new(tenants.into_iter().collect()),
        }
    }

    pub fn add(&self, tenant_id: TenantId) {
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        if !tenants.contains(&tenant_id) {
            tenants.push(tenant_id);
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn list_tenants(&self) -> Result<Vec<TenantId>, DirectoryError> {
        Ok(self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Reads tenant ids from the platform's `site_tenant` table.
#[derive(Debug, Clone)]
pub struct PostgresTenantDirectory {
    pool: Arc<PgPool>,
}

impl PostgresTenantDirectory {
    pub const LIST_SQL: &'static str = "SELECT \"uuid\"::text AS \"uuid\" FROM \"site_tenant\" ORDER BY \"uuid\" ASC";

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TenantDirectory for PostgresTenantDirectory {
    #[instrument(skip(self), err)]
    async fn list_tenants(&self) -> Result<Vec<TenantId>, DirectoryError> {
        let rows = sqlx::query(Self::LIST_SQL)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("list_tenants: {e}")))?;

        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("uuid")
                    .map_err(|e| DirectoryError::InvalidRow(e.to_string()))?;
                Uuid::parse_str(&raw)
                    .map(TenantId::from_uuid)
                    .map_err(|e| DirectoryError::InvalidRow(format!("{raw}: {e}")))
            })
            .collect()
    }
}
