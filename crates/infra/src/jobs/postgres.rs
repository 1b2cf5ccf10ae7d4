//! Postgres-backed pending trigger store.
//!
//! Each tenant owns a schema (`<prefix><tenant uuid, simple form>`) holding one
//! `site_pending_trigger` table:
//!
//! | column | type | set by |
//! |--------|------|--------|
//! | `uuid` | `VARCHAR(255)` primary key | caller (job id) |
//! | `created_at` | `TIMESTAMPTZ` | store, on insert |
//! | `updated_at` | `TIMESTAMPTZ` | store, on insert |
//! | `key` | `TEXT` | caller |
//! | `data` | `JSONB` | caller |
//! | `user` | `JSONB` | caller |
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any | `Storage` |
//! | Io / PoolTimedOut / PoolClosed | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! The table is created on first use per tenant (`CREATE ... IF NOT EXISTS`).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::{debug, instrument};

use relay_core::{RequestId, TenantId};

use super::store::{PendingTriggerStore, StoreError};
use super::types::PendingTriggerJob;

pub const PENDING_TRIGGER_TABLE: &str = "site_pending_trigger";

/// Schema that holds a tenant's pending triggers.
pub fn tenant_schema(prefix: &str, tenant_id: TenantId) -> String {
    format!("{prefix}{}", tenant_id.as_uuid().simple())
}

fn qualified_table(schema: &str) -> String {
    format!("\"{schema}\".\"{PENDING_TRIGGER_TABLE}\"")
}

pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\"")
}

pub fn create_table_sql(schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         \"uuid\" VARCHAR(255) PRIMARY KEY, \
         \"created_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
         \"updated_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
         \"key\" TEXT NOT NULL, \
         \"data\" JSONB NOT NULL, \
         \"user\" JSONB NOT NULL)",
        qualified_table(schema)
    )
}

pub fn insert_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {} (\"uuid\", \"created_at\", \"updated_at\", \"key\", \"data\", \"user\") \
         VALUES ($1, NOW(), NOW(), $2, $3, $4) RETURNING \"created_at\", \"updated_at\"",
        qualified_table(schema)
    )
}

pub fn delete_sql(schema: &str) -> String {
    format!("DELETE FROM {} WHERE (\"uuid\" = $1)", qualified_table(schema))
}

pub fn select_all_sql(schema: &str) -> String {
    format!(
        "SELECT \"uuid\", \"created_at\", \"updated_at\", \"key\", \"data\", \"user\" FROM {} \
         ORDER BY \"created_at\" ASC, \"uuid\" ASC",
        qualified_table(schema)
    )
}

/// Postgres implementation of [`PendingTriggerStore`].
#[derive(Debug, Clone)]
pub struct PostgresPendingTriggerStore {
    pool: Arc<PgPool>,
    schema_prefix: String,
    prepared: Arc<Mutex<HashSet<TenantId>>>,
}

impl PostgresPendingTriggerStore {
    pub fn new(pool: PgPool, schema_prefix: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            schema_prefix: schema_prefix.into(),
            prepared: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn schema(&self, tenant_id: TenantId) -> String {
        tenant_schema(&self.schema_prefix, tenant_id)
    }

    /// Create the tenant's schema and table if they do not exist yet.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn ensure_table(&self, tenant_id: TenantId) -> Result<(), StoreError> {
        let already = self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&tenant_id);
        if already {
            return Ok(());
        }

        let schema = self.schema(tenant_id);
        sqlx::query(&create_schema_sql(&schema))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        sqlx::query(&create_table_sql(&schema))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;

        debug!(schema = %schema, "pending trigger table ready");
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id);
        Ok(())
    }
}

#[async_trait]
impl PendingTriggerStore for PostgresPendingTriggerStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.tenant_id, request_id = %job.id), err)]
    async fn create(&self, job: &PendingTriggerJob) -> Result<PendingTriggerJob, StoreError> {
        self.ensure_table(job.tenant_id).await?;

        let row = sqlx::query(&insert_sql(&self.schema(job.tenant_id)))
            .bind(job.id.as_str())
            .bind(&job.key)
            .bind(&job.data)
            .bind(&job.user)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(job.id.clone())
                } else {
                    map_sqlx_error("insert_pending_trigger", e)
                }
            })?;

        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| StoreError::Decode(format!("created_at: {e}")))?;
        let updated_at: DateTime<Utc> = row
            .try_get("updated_at")
            .map_err(|e| StoreError::Decode(format!("updated_at: {e}")))?;

        let mut stored = job.clone();
        stored.created_at = created_at;
        stored.updated_at = updated_at;
        stored.row_log_id = None;
        Ok(stored)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, request_id = %id), err)]
    async fn remove(&self, tenant_id: TenantId, id: &RequestId) -> Result<bool, StoreError> {
        self.ensure_table(tenant_id).await?;

        let result = sqlx::query(&delete_sql(&self.schema(tenant_id)))
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_pending_trigger", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<PendingTriggerJob>, StoreError> {
        self.ensure_table(tenant_id).await?;

        let rows = sqlx::query(&select_all_sql(&self.schema(tenant_id)))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_pending_triggers", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let row = PendingTriggerRow::from_row(&row)
                .map_err(|e| StoreError::Decode(format!("failed to read pending trigger row: {e}")))?;
            jobs.push(row.into_job(tenant_id)?);
        }
        Ok(jobs)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[derive(Debug)]
struct PendingTriggerRow {
    uuid: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    key: String,
    data: JsonValue,
    user: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PendingTriggerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(PendingTriggerRow {
            uuid: row.try_get("uuid")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            key: row.try_get("key")?,
            data: row.try_get("data")?,
            user: row.try_get("user")?,
        })
    }
}

impl PendingTriggerRow {
    fn into_job(self, tenant_id: TenantId) -> Result<PendingTriggerJob, StoreError> {
        let id = RequestId::parse(self.uuid)
            .map_err(|e| StoreError::Decode(format!("uuid: {e}")))?;
        Ok(PendingTriggerJob {
            id,
            tenant_id,
            key: self.key,
            data: self.data,
            user: self.user,
            row_log_id: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const SCHEMA: &str = "tenant_0190b2a0c0de7000800000000000abcd";

    #[test]
    fn tenant_schema_uses_simple_uuid() {
        let tenant = TenantId::from_uuid(Uuid::parse_str("0190b2a0-c0de-7000-8000-00000000abcd").unwrap());
        assert_eq!(tenant_schema("tenant_", tenant), SCHEMA);
    }

    #[test]
    fn insert_sql_has_expected_shape() {
        assert_eq!(
            insert_sql(SCHEMA),
            "INSERT INTO \"tenant_0190b2a0c0de7000800000000000abcd\".\"site_pending_trigger\" \
             (\"uuid\", \"created_at\", \"updated_at\", \"key\", \"data\", \"user\") \
             VALUES ($1, NOW(), NOW(), $2, $3, $4) RETURNING \"created_at\", \"updated_at\""
        );
    }

    #[test]
    fn delete_sql_has_expected_shape() {
        assert_eq!(
            delete_sql(SCHEMA),
            "DELETE FROM \"tenant_0190b2a0c0de7000800000000000abcd\".\"site_pending_trigger\" WHERE (\"uuid\" = $1)"
        );
    }

    #[test]
    fn select_sql_reads_every_column() {
        let sql = select_all_sql(SCHEMA);
        assert!(sql.starts_with(
            "SELECT \"uuid\", \"created_at\", \"updated_at\", \"key\", \"data\", \"user\" FROM \
             \"tenant_0190b2a0c0de7000800000000000abcd\".\"site_pending_trigger\""
        ));
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn create_table_quotes_reserved_user_column() {
        let sql = create_table_sql(SCHEMA);
        assert!(sql.contains("\"user\" JSONB NOT NULL"));
        assert!(sql.contains("\"uuid\" VARCHAR(255) PRIMARY KEY"));
        assert_eq!(
            create_schema_sql(SCHEMA),
            "CREATE SCHEMA IF NOT EXISTS \"tenant_0190b2a0c0de7000800000000000abcd\""
        );
    }
}
