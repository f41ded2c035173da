//! Subscription lifecycle
//!
//! Gateway events are applied as the new truth of subscription state, even
//! when they arrive out of order: a `payment.succeeded` landing after a
//! `subscription.cancelled` reactivates the row, because the gateway is
//! authoritative for the remote lifecycle and the most recent event wins.
//! The ledger already guarantees each event applies at most once.
//!
//! The ordering contract for locally-initiated mutations is the opposite:
//! the remote gateway call happens first, the local commit second, so a
//! gateway failure never leaves local state ahead of the remote.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::coupons::CouponService;
use crate::error::{CoreError, CoreResult};
use crate::events::{publish_best_effort, AuditEntry, AuditLogger, EventBus};
use crate::gateway::GatewayClient;
use crate::proration::{compute_proration, BillingFrequency, PlanPricing, Price, ProrationDelta};
use crate::tax::TenantConfigService;
use crate::tenancy::Tenant;
use crate::webhooks::{EventDispatcher, WebhookEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Incomplete,
    Active,
    PastDue,
    Paused,
    Cancelled,
}

/// Normalized gateway event vocabulary. Providers use several spellings for
/// the same lifecycle moment; everything unrecognized is preserved as
/// `Unknown` so it can be acknowledged without effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventType {
    Activated,
    Suspended,
    PaymentFailed,
    PaymentSucceeded,
    Cancelled,
    Unknown(String),
}

impl GatewayEventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "subscription.activated" | "subscription.resumed" => GatewayEventType::Activated,
            "subscription.paused" | "subscription.suspended" => GatewayEventType::Suspended,
            "payment.failed" | "invoice.payment_failed" => GatewayEventType::PaymentFailed,
            "payment.succeeded" | "invoice.paid" | "invoice.payment_succeeded" => {
                GatewayEventType::PaymentSucceeded
            }
            "subscription.cancelled" | "subscription.canceled" | "subscription.deleted" => {
                GatewayEventType::Cancelled
            }
            other => GatewayEventType::Unknown(other.to_string()),
        }
    }

    /// The status this event asserts, or `None` for events with no status
    /// effect.
    pub fn asserted_status(&self) -> Option<SubscriptionStatus> {
        match self {
            GatewayEventType::Activated => Some(SubscriptionStatus::Active),
            GatewayEventType::Suspended => Some(SubscriptionStatus::Paused),
            GatewayEventType::PaymentFailed => Some(SubscriptionStatus::PastDue),
            GatewayEventType::PaymentSucceeded => Some(SubscriptionStatus::Active),
            GatewayEventType::Cancelled => Some(SubscriptionStatus::Cancelled),
            GatewayEventType::Unknown(_) => None,
        }
    }
}

/// `past_due_since` marks the start of the *current* past-due episode. It
/// is stamped on entry, held while the episode lasts, and cleared the
/// moment the subscription leaves past-due. A later episode gets a fresh
/// stamp; dunning timers never measure across a recovery.
pub fn past_due_since_after(
    current_status: SubscriptionStatus,
    current_stamp: Option<OffsetDateTime>,
    new_status: SubscriptionStatus,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    match (
        current_status == SubscriptionStatus::PastDue,
        new_status == SubscriptionStatus::PastDue,
    ) {
        (false, true) => Some(now),
        (true, true) => current_stamp.or(Some(now)),
        (_, false) => None,
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub plan_version: i32,
    pub external_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub frequency: BillingFrequency,
    pub currency: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub past_due_since: Option<OffsetDateTime>,
    pub scheduled_plan_id: Option<Uuid>,
    pub scheduled_change_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, plan_version, \
     external_subscription_id, status, frequency, currency, \
     current_period_start, current_period_end, trial_ends_at, past_due_since, \
     scheduled_plan_id, scheduled_change_date, created_at, updated_at";

/// Status a new subscription starts in: trialing while the trial window is
/// open, incomplete until the gateway confirms payment otherwise.
pub fn initial_status(
    trial_ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> SubscriptionStatus {
    match trial_ends_at {
        Some(ends_at) if ends_at > now => SubscriptionStatus::Trialing,
        _ => SubscriptionStatus::Incomplete,
    }
}

/// Loads plan pricing from the catalog tables. Prices are immutable rows;
/// editing a plan bumps its version, and invoices snapshot the version they
/// billed against.
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn pricing(&self, plan_id: Uuid) -> CoreResult<PlanPricing> {
        let plan: Option<(BillingFrequency, i32, String)> =
            sqlx::query_as("SELECT frequency, version, code FROM plans WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?;
        let (frequency, version, _code) = plan
            .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))?;

        let prices: Vec<(String, BillingFrequency, i64)> = sqlx::query_as(
            "SELECT currency, frequency, amount_minor FROM prices WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(PlanPricing {
            plan_id,
            frequency,
            version,
            prices: prices
                .into_iter()
                .map(|(currency, frequency, amount_minor)| Price {
                    currency,
                    frequency,
                    amount_minor,
                })
                .collect(),
        })
    }

    pub async fn plan_code(&self, plan_id: Uuid) -> CoreResult<String> {
        let code: Option<(String,)> = sqlx::query_as("SELECT code FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        code.map(|(c,)| c)
            .ok_or_else(|| CoreError::NotFound(format!("plan {plan_id}")))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangePreview {
    pub subscription_id: Uuid,
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub delta: ProrationDelta,
    pub immediate: bool,
    pub effective_date: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeResult {
    pub subscription_id: Uuid,
    pub to_plan_id: Uuid,
    pub scheduled: bool,
    pub effective_date: OffsetDateTime,
    pub invoice_id: Option<Uuid>,
}

pub struct SubscriptionService {
    pool: PgPool,
    catalog: PlanCatalog,
    tenant_config: TenantConfigService,
    gateway: Arc<dyn GatewayClient>,
    audit: AuditLogger,
    bus: Arc<dyn EventBus>,
}

impl SubscriptionService {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn GatewayClient>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            catalog: PlanCatalog::new(pool.clone()),
            tenant_config: TenantConfigService::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            pool,
            gateway,
            bus,
        }
    }

    async fn fetch_scoped(&self, tenant_id: Uuid, subscription_id: Uuid) -> CoreResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 AND tenant_id = $2",
        ))
        .bind(subscription_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        sub.ok_or_else(|| CoreError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// The tenant's billable subscription. At most one exists by invariant;
    /// the newest wins if the invariant is violated so callers stay usable
    /// while the checker flags the data.
    pub async fn billable_for_tenant(&self, tenant_id: Uuid) -> CoreResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE tenant_id = $1
              AND status IN ('active', 'trialing', 'past_due', 'incomplete')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        sub.ok_or_else(|| {
            CoreError::SubscriptionNotFound(format!("no billable subscription for tenant {tenant_id}"))
        })
    }

    /// Create a subscription: price must resolve before the gateway is
    /// touched, and the gateway subscription must exist before the local
    /// row does.
    pub async fn create(
        &self,
        tenant: &Tenant,
        plan_id: Uuid,
        currency: &str,
        trial_days: Option<i64>,
    ) -> CoreResult<Subscription> {
        let pricing = self.catalog.pricing(plan_id).await?;
        pricing.price_for(currency)?;
        let plan_code = self.catalog.plan_code(plan_id).await?;

        let external_id = self
            .gateway
            .create_remote_subscription(tenant.id, &plan_code, currency)
            .await?;

        let now = OffsetDateTime::now_utc();
        let period_end = now + Duration::days(pricing.frequency.cycle_days() as i64);
        let trial_ends_at = trial_days
            .filter(|days| *days > 0)
            .map(|days| now + Duration::days(days));
        let status = initial_status(trial_ends_at, now);
        let sub: Subscription = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, plan_id, plan_version, external_subscription_id,
                 status, frequency, currency, current_period_start,
                 current_period_end, trial_ends_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#,
        ))
        .bind(Uuid::new_v4())
        .bind(tenant.id)
        .bind(plan_id)
        .bind(pricing.version)
        .bind(&external_id)
        .bind(status)
        .bind(pricing.frequency)
        .bind(currency.to_lowercase())
        .bind(now)
        .bind(period_end)
        .bind(trial_ends_at)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .log_best_effort(AuditEntry::new(
                Some(tenant.id),
                "subscription.created",
                serde_json::json!({
                    "subscription_id": sub.id,
                    "plan_id": plan_id,
                    "external_subscription_id": external_id,
                }),
            ))
            .await;

        tracing::info!(tenant_id = %tenant.id, subscription_id = %sub.id, "Subscription created");
        Ok(sub)
    }

    /// Preview the proration of a plan change without touching state. Backed
    /// by the exact function the commit path uses.
    pub async fn preview_plan_change(
        &self,
        tenant: &Tenant,
        subscription_id: Uuid,
        to_plan_id: Uuid,
    ) -> CoreResult<PlanChangePreview> {
        let sub = self.fetch_scoped(tenant.id, subscription_id).await?;
        let current = self.catalog.pricing(sub.plan_id).await?;
        let next = self.catalog.pricing(to_plan_id).await?;
        let tax = self.tenant_config.tax_config(tenant.id).await?;

        let delta = compute_proration(
            &current,
            sub.current_period_end,
            &next,
            &sub.currency,
            tax.rate(),
            OffsetDateTime::now_utc(),
        )?;

        let immediate = delta.amount_minor >= 0;
        Ok(PlanChangePreview {
            subscription_id,
            from_plan_id: sub.plan_id,
            to_plan_id,
            delta,
            immediate,
            effective_date: if immediate {
                OffsetDateTime::now_utc()
            } else {
                sub.current_period_end
            },
        })
    }

    /// Commit a plan change. Upgrades (non-negative delta) apply
    /// immediately: remote plan update first, then one transaction issuing
    /// the proration invoice and switching the plan. Downgrades are
    /// scheduled for the period boundary and applied at renewal.
    pub async fn commit_plan_change(
        &self,
        tenant: &Tenant,
        subscription_id: Uuid,
        to_plan_id: Uuid,
    ) -> CoreResult<PlanChangeResult> {
        let preview = self
            .preview_plan_change(tenant, subscription_id, to_plan_id)
            .await?;
        let sub = self.fetch_scoped(tenant.id, subscription_id).await?;

        if !preview.immediate {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET scheduled_plan_id = $1, scheduled_change_date = current_period_end,
                    updated_at = NOW()
                WHERE id = $2 AND tenant_id = $3
                "#,
            )
            .bind(to_plan_id)
            .bind(subscription_id)
            .bind(tenant.id)
            .execute(&self.pool)
            .await?;

            self.audit
                .log_best_effort(AuditEntry::new(
                    Some(tenant.id),
                    "subscription.downgrade_scheduled",
                    serde_json::json!({
                        "subscription_id": subscription_id,
                        "to_plan_id": to_plan_id,
                        "effective_date": preview.effective_date.to_string(),
                    }),
                ))
                .await;

            tracing::info!(
                tenant_id = %tenant.id,
                subscription_id = %subscription_id,
                "Plan downgrade scheduled for period end"
            );
            return Ok(PlanChangeResult {
                subscription_id,
                to_plan_id,
                scheduled: true,
                effective_date: preview.effective_date,
                invoice_id: None,
            });
        }

        // Remote first. A failure here aborts with no local change.
        let plan_code = self.catalog.plan_code(to_plan_id).await?;
        let external_id = sub.external_subscription_id.as_deref().ok_or_else(|| {
            CoreError::InvalidInput(format!(
                "subscription {subscription_id} has no gateway subscription"
            ))
        })?;
        self.gateway.update_remote_plan(external_id, &plan_code).await?;

        let next = self.catalog.pricing(to_plan_id).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "SELECT id FROM subscriptions WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(subscription_id)
        .bind(tenant.id)
        .execute(&mut *tx)
        .await?;

        let invoice_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, tenant_id, subscription_id, plan_id, plan_version, kind,
                 amount_minor, discount_minor, tax_minor, currency,
                 unit_price_minor, period_start, period_end, issued_at)
            VALUES ($1, $2, $3, $4, $5, 'proration', $6, 0, $7, $8, $9, $10, $11, NOW())
            "#,
        )
        .bind(invoice_id)
        .bind(tenant.id)
        .bind(subscription_id)
        .bind(to_plan_id)
        .bind(next.version)
        .bind(preview.delta.amount_minor)
        .bind(preview.delta.tax_minor)
        .bind(&sub.currency)
        .bind(next.price_for(&sub.currency)?)
        .bind(OffsetDateTime::now_utc())
        .bind(sub.current_period_end)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = $1, plan_version = $2, frequency = $3,
                scheduled_plan_id = NULL, scheduled_change_date = NULL,
                updated_at = NOW()
            WHERE id = $4 AND tenant_id = $5
            "#,
        )
        .bind(to_plan_id)
        .bind(next.version)
        .bind(next.frequency)
        .bind(subscription_id)
        .bind(tenant.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.audit
            .log_best_effort(AuditEntry::new(
                Some(tenant.id),
                "subscription.plan_changed",
                serde_json::json!({
                    "subscription_id": subscription_id,
                    "from_plan_id": sub.plan_id,
                    "to_plan_id": to_plan_id,
                    "proration_minor": preview.delta.amount_minor,
                    "invoice_id": invoice_id,
                }),
            ))
            .await;
        publish_best_effort(
            self.bus.as_ref(),
            "subscription.plan_changed",
            &serde_json::json!({
                "tenant_id": tenant.id,
                "subscription_id": subscription_id,
                "to_plan_id": to_plan_id,
            }),
        )
        .await;

        tracing::info!(
            tenant_id = %tenant.id,
            subscription_id = %subscription_id,
            to_plan_id = %to_plan_id,
            "Plan changed immediately"
        );
        Ok(PlanChangeResult {
            subscription_id,
            to_plan_id,
            scheduled: false,
            effective_date: OffsetDateTime::now_utc(),
            invoice_id: Some(invoice_id),
        })
    }

    /// Cancel at the gateway, then locally.
    pub async fn cancel(&self, tenant: &Tenant, subscription_id: Uuid) -> CoreResult<()> {
        let sub = self.fetch_scoped(tenant.id, subscription_id).await?;
        if let Some(external_id) = sub.external_subscription_id.as_deref() {
            self.gateway.cancel_remote_subscription(external_id).await?;
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', past_due_since = NULL, updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            "#,
        )
        .bind(subscription_id)
        .bind(tenant.id)
        .execute(&self.pool)
        .await?;

        self.audit
            .log_best_effort(AuditEntry::new(
                Some(tenant.id),
                "subscription.cancelled",
                serde_json::json!({ "subscription_id": subscription_id }),
            ))
            .await;
        Ok(())
    }

    /// Flip subscriptions whose trial window lapsed without a payment event
    /// into past-due, stamping the episode. Run periodically by the worker.
    pub async fn expire_trials(&self) -> CoreResult<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', past_due_since = NOW(), updated_at = NOW()
            WHERE status = 'trialing' AND trial_ends_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        if expired > 0 {
            tracing::info!(expired = expired, "Expired lapsed trials");
        }
        Ok(expired)
    }

    async fn fetch_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> CoreResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE external_subscription_id = $1 AND tenant_id = $2
            "#,
        ))
        .bind(external_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        sub.ok_or_else(|| CoreError::SubscriptionNotFound(external_id.to_string()))
    }

    /// Renewal: one transaction that advances the period, applies any
    /// scheduled plan change, bills uncharged usage, consumes one coupon
    /// period, and issues the invoice. The invoice snapshots amount, tax,
    /// unit price, and plan version; catalog edits after issuance never
    /// reprice it.
    async fn renew(&self, tenant: &Tenant, sub: &Subscription) -> CoreResult<Uuid> {
        // Scheduled downgrades take effect at the boundary being crossed.
        let (plan_id, apply_scheduled) = match (sub.scheduled_plan_id, sub.scheduled_change_date) {
            (Some(scheduled), Some(date)) if date <= sub.current_period_end => (scheduled, true),
            _ => (sub.plan_id, false),
        };
        let pricing = self.catalog.pricing(plan_id).await?;
        let unit_price = pricing.price_for(&sub.currency)?;
        let tax = self.tenant_config.tax_config(tenant.id).await?;

        let period_start = sub.current_period_end;
        let period_end = period_start + Duration::days(pricing.frequency.cycle_days() as i64);

        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM subscriptions WHERE id = $1 FOR UPDATE")
            .bind(sub.id)
            .execute(&mut *tx)
            .await?;

        let usage_minor: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_minor), 0) FROM usage_events
            WHERE subscription_id = $1 AND charged_at IS NULL
            "#,
        )
        .bind(sub.id)
        .fetch_one(&mut *tx)
        .await?;

        let gross = unit_price + usage_minor;
        let discount = CouponService::apply_entitlement(&mut tx, sub.id, gross, &sub.currency)
            .await?;
        let net = gross - discount;
        let tax_minor = (net as f64 * tax.rate()).round() as i64;

        let invoice_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, tenant_id, subscription_id, plan_id, plan_version, kind,
                 amount_minor, discount_minor, tax_minor, currency,
                 unit_price_minor, period_start, period_end, issued_at)
            VALUES ($1, $2, $3, $4, $5, 'renewal', $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(invoice_id)
        .bind(tenant.id)
        .bind(sub.id)
        .bind(plan_id)
        .bind(pricing.version)
        .bind(net)
        .bind(discount)
        .bind(tax_minor)
        .bind(&sub.currency)
        .bind(unit_price)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE usage_events SET charged_at = NOW(), invoice_id = $1
            WHERE subscription_id = $2 AND charged_at IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', past_due_since = NULL,
                plan_id = $1, plan_version = $2, frequency = $3,
                current_period_start = $4, current_period_end = $5,
                scheduled_plan_id = CASE WHEN $6 THEN NULL ELSE scheduled_plan_id END,
                scheduled_change_date = CASE WHEN $6 THEN NULL ELSE scheduled_change_date END,
                updated_at = NOW()
            WHERE id = $7
            "#,
        )
        .bind(plan_id)
        .bind(pricing.version)
        .bind(pricing.frequency)
        .bind(period_start)
        .bind(period_end)
        .bind(apply_scheduled)
        .bind(sub.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        // A scheduled downgrade was driven by renewal, not by the gateway;
        // sync the remote plan after commit. Best-effort: the next change
        // or a reconciliation pass repairs a missed sync.
        if apply_scheduled {
            if let (Ok(code), Some(external_id)) = (
                self.catalog.plan_code(plan_id).await,
                sub.external_subscription_id.as_deref(),
            ) {
                if let Err(e) = self.gateway.update_remote_plan(external_id, &code).await {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to sync scheduled plan change to gateway"
                    );
                }
            }
        }

        self.audit
            .log_best_effort(AuditEntry::new(
                Some(tenant.id),
                "subscription.renewed",
                serde_json::json!({
                    "subscription_id": sub.id,
                    "invoice_id": invoice_id,
                    "amount_minor": net,
                    "discount_minor": discount,
                    "tax_minor": tax_minor,
                    "usage_minor": usage_minor,
                }),
            ))
            .await;
        publish_best_effort(
            self.bus.as_ref(),
            "subscription.renewed",
            &serde_json::json!({
                "tenant_id": tenant.id,
                "subscription_id": sub.id,
                "invoice_id": invoice_id,
            }),
        )
        .await;

        tracing::info!(
            tenant_id = %tenant.id,
            subscription_id = %sub.id,
            invoice_id = %invoice_id,
            "Subscription renewed"
        );
        Ok(invoice_id)
    }

    /// Apply a status-only event (activation, suspension, payment failure,
    /// cancellation) as the new truth.
    async fn apply_status(
        &self,
        tenant: &Tenant,
        sub: &Subscription,
        new_status: SubscriptionStatus,
    ) -> CoreResult<()> {
        let now = OffsetDateTime::now_utc();
        let past_due_since = past_due_since_after(sub.status, sub.past_due_since, new_status, now);

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, past_due_since = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(new_status)
        .bind(past_due_since)
        .bind(sub.id)
        .execute(&self.pool)
        .await?;

        self.audit
            .log_best_effort(AuditEntry::new(
                Some(tenant.id),
                "subscription.status_changed",
                serde_json::json!({
                    "subscription_id": sub.id,
                    "from": sub.status,
                    "to": new_status,
                }),
            ))
            .await;
        publish_best_effort(
            self.bus.as_ref(),
            "subscription.status_changed",
            &serde_json::json!({
                "tenant_id": tenant.id,
                "subscription_id": sub.id,
                "status": new_status,
            }),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl EventDispatcher for SubscriptionService {
    async fn tenant_for_subscription(&self, external_subscription_id: &str) -> CoreResult<Uuid> {
        let tenant_id: Option<(Uuid,)> = sqlx::query_as(
            "SELECT tenant_id FROM subscriptions WHERE external_subscription_id = $1",
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        tenant_id.map(|(id,)| id).ok_or_else(|| {
            CoreError::TenantResolutionFailed(format!(
                "no subscription with gateway id {external_subscription_id}"
            ))
        })
    }

    async fn dispatch(&self, tenant: &Tenant, envelope: &WebhookEnvelope) -> CoreResult<()> {
        let event = GatewayEventType::parse(&envelope.event_type);

        if let GatewayEventType::Unknown(ref kind) = event {
            tracing::warn!(
                tenant_id = %tenant.id,
                event_type = %kind,
                "Unknown gateway event type acknowledged without effect"
            );
            return Ok(());
        }

        let external_id = envelope.external_subscription_id.as_deref().ok_or_else(|| {
            CoreError::EnvelopeMalformed(format!(
                "{} event carries no subscription id",
                envelope.event_type
            ))
        })?;
        let sub = self.fetch_by_external_id(tenant.id, external_id).await?;

        match event {
            GatewayEventType::PaymentSucceeded => {
                self.renew(tenant, &sub).await?;
            }
            other => {
                // asserted_status is Some for every non-Unknown event.
                if let Some(status) = other.asserted_status() {
                    self.apply_status(tenant, &sub, status).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_parsing_covers_provider_spellings() {
        assert_eq!(
            GatewayEventType::parse("invoice.payment_failed"),
            GatewayEventType::PaymentFailed
        );
        assert_eq!(
            GatewayEventType::parse("payment.succeeded"),
            GatewayEventType::PaymentSucceeded
        );
        assert_eq!(
            GatewayEventType::parse("subscription.canceled"),
            GatewayEventType::Cancelled
        );
        assert_eq!(
            GatewayEventType::parse("subscription.resumed"),
            GatewayEventType::Activated
        );
        assert!(matches!(
            GatewayEventType::parse("customer.updated"),
            GatewayEventType::Unknown(_)
        ));
    }

    #[test]
    fn every_known_event_asserts_a_status() {
        for raw in [
            "subscription.activated",
            "subscription.suspended",
            "payment.failed",
            "payment.succeeded",
            "subscription.cancelled",
        ] {
            let event = GatewayEventType::parse(raw);
            assert!(event.asserted_status().is_some(), "{raw} asserts nothing");
        }
        assert_eq!(
            GatewayEventType::Unknown("x".to_string()).asserted_status(),
            None
        );
    }

    #[test]
    fn late_event_still_applies_as_new_truth() {
        // Cancellation followed by a late activation: the activation wins,
        // because each gateway event asserts current remote state.
        let event = GatewayEventType::parse("subscription.activated");
        assert_eq!(event.asserted_status(), Some(SubscriptionStatus::Active));
        // Nothing in the mapping depends on the prior status.
    }

    #[test]
    fn trial_window_decides_the_initial_status() {
        let now = OffsetDateTime::now_utc();

        assert_eq!(
            initial_status(Some(now + Duration::days(14)), now),
            SubscriptionStatus::Trialing
        );
        assert_eq!(initial_status(None, now), SubscriptionStatus::Incomplete);
        // A trial end in the past never opens a trial.
        assert_eq!(
            initial_status(Some(now - Duration::days(1)), now),
            SubscriptionStatus::Incomplete
        );
    }

    #[test]
    fn past_due_stamp_marks_episode_entry_only() {
        let now = OffsetDateTime::now_utc();
        let earlier = now - Duration::days(3);

        // Entering past due stamps now.
        assert_eq!(
            past_due_since_after(
                SubscriptionStatus::Active,
                None,
                SubscriptionStatus::PastDue,
                now
            ),
            Some(now)
        );

        // A second failure in the same episode keeps the original stamp.
        assert_eq!(
            past_due_since_after(
                SubscriptionStatus::PastDue,
                Some(earlier),
                SubscriptionStatus::PastDue,
                now
            ),
            Some(earlier)
        );

        // Recovery clears it.
        assert_eq!(
            past_due_since_after(
                SubscriptionStatus::PastDue,
                Some(earlier),
                SubscriptionStatus::Active,
                now
            ),
            None
        );

        // A later episode gets a fresh stamp, not the old one.
        assert_eq!(
            past_due_since_after(
                SubscriptionStatus::Active,
                None,
                SubscriptionStatus::PastDue,
                now
            ),
            Some(now)
        );
    }
}
