//! Audit trail and event publication
//!
//! Both sinks are invoked after the owning transaction commits and are
//! best-effort: callers log a warning on failure and move on, they never
//! roll back billing state over a missed audit row or a dropped publish.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: Option<Uuid>,
    pub action: String,
    pub detail: Value,
}

impl AuditEntry {
    pub fn new(tenant_id: Option<Uuid>, action: impl Into<String>, detail: Value) -> Self {
        Self {
            tenant_id,
            action: action.into(),
            detail,
        }
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, entry: AuditEntry) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, tenant_id, action, detail, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.tenant_id)
        .bind(&entry.action)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fire-and-forget variant for post-commit call sites.
    pub async fn log_best_effort(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.log(entry).await {
            tracing::warn!(action = %action, error = %e, "Failed to write audit entry");
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> CoreResult<()>;
}

/// Publishes engine events over Redis pub/sub for downstream consumers
/// (notification services, analytics).
pub struct RedisEventBus {
    conn: ConnectionManager,
}

impl RedisEventBus {
    pub async fn connect(redis_url: &str) -> CoreResult<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CoreError::Internal(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, payload: &Value) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(body)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

/// Fallback bus when Redis is not configured: events land in the log stream
/// only.
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, channel: &str, payload: &Value) -> CoreResult<()> {
        tracing::info!(channel = channel, payload = %payload, "Engine event");
        Ok(())
    }
}

/// Post-commit publish helper with the same best-effort contract as
/// [`AuditLogger::log_best_effort`].
pub async fn publish_best_effort(bus: &dyn EventBus, channel: &str, payload: &Value) {
    if let Err(e) = bus.publish(channel, payload).await {
        tracing::warn!(channel = channel, error = %e, "Failed to publish engine event");
    }
}
