//! Tenant registry
//!
//! Resolves tenant identifiers to tenant metadata and owns the lifecycle
//! events that matter to the connection cache: when a tenant's datasource
//! locator changes, or dedicated isolation is toggled off, the *old*
//! locator's cache entry is evicted; the new one is created lazily on the
//! next access.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::tenancy::lease_cache::ConnectionLeaseCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    Shared,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deactivated,
}

/// Tenant metadata. `datasource_locator` is only meaningful when
/// `isolation` is `Dedicated`. Tenants are never hard-deleted in production
/// paths; `status` carries soft transitions.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub isolation: IsolationMode,
    pub datasource_locator: Option<String>,
    pub status: TenantStatus,
    pub created_at: OffsetDateTime,
}

impl Tenant {
    pub fn is_dedicated(&self) -> bool {
        self.isolation == IsolationMode::Dedicated && self.datasource_locator.is_some()
    }
}

#[derive(Clone)]
pub struct TenantRegistry {
    pool: PgPool,
    lease_cache: Arc<ConnectionLeaseCache>,
}

impl TenantRegistry {
    pub fn new(pool: PgPool, lease_cache: Arc<ConnectionLeaseCache>) -> Self {
        Self { pool, lease_cache }
    }

    /// Resolve a tenant id to its metadata. Unknown ids are a
    /// `TenantNotFound`; webhook callers map this to the retry-eligible
    /// `TenantResolutionFailed` at the envelope layer.
    pub async fn resolve(&self, tenant_id: Uuid) -> CoreResult<Tenant> {
        let tenant: Option<Tenant> = sqlx::query_as(
            r#"
            SELECT id, name, isolation, datasource_locator, status, created_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        tenant.ok_or(CoreError::TenantNotFound(tenant_id))
    }

    /// Provision a new tenant on the shared datastore.
    pub async fn create(&self, name: &str) -> CoreResult<Tenant> {
        let tenant: Tenant = sqlx::query_as(
            r#"
            INSERT INTO tenants (id, name, isolation, datasource_locator, status, created_at)
            VALUES ($1, $2, 'shared', NULL, 'active', NOW())
            RETURNING id, name, isolation, datasource_locator, status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(tenant_id = %tenant.id, name = %tenant.name, "Tenant provisioned");
        Ok(tenant)
    }

    pub async fn set_status(&self, tenant_id: Uuid, status: TenantStatus) -> CoreResult<()> {
        let result = sqlx::query("UPDATE tenants SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::TenantNotFound(tenant_id));
        }
        tracing::info!(tenant_id = %tenant_id, status = ?status, "Tenant status updated");
        Ok(())
    }

    /// Move a dedicated tenant to a new datasource locator. The previous
    /// locator's cached pool is evicted immediately; the new locator's pool
    /// is constructed lazily on next access.
    pub async fn set_datasource_locator(
        &self,
        tenant_id: Uuid,
        new_locator: &str,
    ) -> CoreResult<()> {
        let tenant = self.resolve(tenant_id).await?;

        sqlx::query(
            "UPDATE tenants SET isolation = 'dedicated', datasource_locator = $1 WHERE id = $2",
        )
        .bind(new_locator)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if let Some(old_locator) = tenant.datasource_locator.as_deref() {
            if old_locator != new_locator {
                self.lease_cache.invalidate(old_locator).await;
            }
        }

        tracing::info!(tenant_id = %tenant_id, "Tenant datasource locator changed");
        Ok(())
    }

    /// Toggle a tenant back to the shared datastore. Evicts the dedicated
    /// pool if one was cached.
    pub async fn set_shared_isolation(&self, tenant_id: Uuid) -> CoreResult<()> {
        let tenant = self.resolve(tenant_id).await?;

        sqlx::query(
            "UPDATE tenants SET isolation = 'shared', datasource_locator = NULL WHERE id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if let Some(locator) = tenant.datasource_locator.as_deref() {
            self.lease_cache.invalidate(locator).await;
        }

        tracing::info!(tenant_id = %tenant_id, "Tenant moved to shared isolation");
        Ok(())
    }

    /// The pool a tenant's scoped data operations should run against:
    /// the dedicated cached pool for dedicated tenants, the shared pool
    /// otherwise.
    pub async fn pool_for(&self, tenant: &Tenant) -> CoreResult<PgPool> {
        match tenant.datasource_locator.as_deref() {
            Some(locator) if tenant.isolation == IsolationMode::Dedicated => {
                self.lease_cache.acquire(locator).await
            }
            _ => Ok(self.pool.clone()),
        }
    }
}
