//! Engine invariants
//!
//! Runnable consistency checks over the control-plane schema. Each
//! invariant is a real SQL query; checks only read, never repair. The
//! worker runs the full set daily and on demand after incident response.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    tenant_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    provider: String,
    external_event_id: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeEntitlementRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    remaining_periods: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct BadInvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct LocatorlessTenantRow {
    tenant_id: Uuid,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnstampedPastDueRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
}

pub struct InvariantChecker {
    pool: PgPool,
    lease_timeout: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, lease_timeout: Duration) -> Self {
        Self {
            pool,
            lease_timeout,
        }
    }

    pub async fn run_all_checks(&self) -> CoreResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_billable_subscription().await?);
        violations.extend(self.check_no_stuck_processing().await?);
        violations.extend(self.check_non_negative_entitlements().await?);
        violations.extend(self.check_invoice_periods_ordered().await?);
        violations.extend(self.check_dedicated_tenants_have_locator().await?);
        violations.extend(self.check_past_due_is_stamped().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one billable subscription per tenant. More than one means
    /// double-billing.
    async fn check_single_billable_subscription(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_billable_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} billable subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// No ledger row may sit in `processing` well past the lease timeout.
    /// The worker's expiry job should have reclaimed it; a persistent
    /// offender means that job is not running.
    async fn check_no_stuck_processing(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT provider, external_event_id, processing_started_at
            FROM webhook_events
            WHERE status = 'processing'
              AND processing_started_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(self.lease_timeout.as_secs_f64() * 2.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_processing".to_string(),
                tenant_ids: vec![],
                description: format!(
                    "Webhook event {}/{} stuck in processing",
                    row.provider, row.external_event_id
                ),
                context: serde_json::json!({
                    "provider": row.provider,
                    "external_event_id": row.external_event_id,
                    "processing_started_at": row.processing_started_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// `remaining_periods` never goes negative; the renewal path decrements
    /// under lock and skips at zero.
    async fn check_non_negative_entitlements(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeEntitlementRow> = sqlx::query_as(
            r#"
            SELECT ce.subscription_id, s.tenant_id, ce.remaining_periods
            FROM coupon_entitlements ce
            JOIN subscriptions s ON s.id = ce.subscription_id
            WHERE ce.remaining_periods < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_entitlements".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Entitlement for subscription {} has {} remaining periods",
                    row.subscription_id, row.remaining_periods
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "remaining_periods": row.remaining_periods,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invoice period bounds must be ordered; an inverted period means the
    /// renewal math went wrong.
    async fn check_invoice_periods_ordered(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<BadInvoiceRow> = sqlx::query_as(
            r#"
            SELECT id as invoice_id, tenant_id, period_start, period_end
            FROM invoices
            WHERE period_end <= period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_periods_ordered".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!("Invoice {} has an inverted billing period", row.invoice_id),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "period_start": row.period_start.to_string(),
                    "period_end": row.period_end.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A dedicated tenant without a datasource locator cannot be routed.
    async fn check_dedicated_tenants_have_locator(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<LocatorlessTenantRow> = sqlx::query_as(
            r#"
            SELECT id as tenant_id, name
            FROM tenants
            WHERE isolation = 'dedicated' AND datasource_locator IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "dedicated_tenants_have_locator".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Dedicated tenant '{}' has no datasource locator",
                    row.name
                ),
                context: serde_json::json!({ "name": row.name }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every past-due subscription carries its episode start; dunning
    /// timers depend on it.
    async fn check_past_due_is_stamped(&self) -> CoreResult<Vec<InvariantViolation>> {
        let rows: Vec<UnstampedPastDueRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, tenant_id
            FROM subscriptions
            WHERE status = 'past_due' AND past_due_since IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "past_due_is_stamped".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Past-due subscription {} has no past_due_since stamp",
                    row.subscription_id
                ),
                context: serde_json::json!({ "subscription_id": row.subscription_id }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
