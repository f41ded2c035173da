//! Coupon and entitlement engine
//!
//! A coupon is a shared definition; an entitlement is one subscription's
//! remaining claim on it (`remaining_periods`, NULL meaning unlimited).
//! Redemption is idempotent on a caller-supplied redemption key, the same
//! shape as the webhook ledger's claim: insert-on-conflict decides exactly
//! one winner, replays observe the recorded outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percent,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CouponDuration {
    Once,
    Repeating,
    Forever,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountKind,
    pub percent_off: Option<f64>,
    /// Fixed discounts are per-currency: a JSON object of currency code to
    /// minor-unit amount. A fixed coupon with no entry for the charge
    /// currency is invalid for that charge.
    pub fixed_amounts: Option<Value>,
    pub duration: CouponDuration,
    pub duration_periods: Option<i32>,
    pub restricted_plan_ids: Vec<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub max_redemptions: Option<i64>,
    pub redeemed_count: i64,
}

impl Coupon {
    fn initial_remaining_periods(&self) -> CoreResult<Option<i32>> {
        match self.duration {
            CouponDuration::Once => Ok(Some(1)),
            CouponDuration::Repeating => {
                let n = self.duration_periods.ok_or_else(|| {
                    CoreError::CouponInvalid(format!(
                        "repeating coupon {} has no duration_periods",
                        self.code
                    ))
                })?;
                Ok(Some(n))
            }
            CouponDuration::Forever => Ok(None),
        }
    }
}

/// Eligibility rules, pure so they are testable without a database.
/// `plan_id` is the plan the discount would apply against;
/// `subscription_id` is the subscription the coupon would attach to, which
/// forever-duration coupons require; `now` is passed in rather than read
/// from the clock.
pub fn evaluate_coupon(
    coupon: &Coupon,
    plan_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    now: OffsetDateTime,
) -> CoreResult<()> {
    if coupon.duration == CouponDuration::Forever && subscription_id.is_none() {
        return Err(CoreError::CouponInvalid(format!(
            "coupon {} applies forever; a subscription is required to validate it",
            coupon.code
        )));
    }
    if let Some(expires_at) = coupon.expires_at {
        if now >= expires_at {
            return Err(CoreError::CouponInvalid(format!(
                "coupon {} expired",
                coupon.code
            )));
        }
    }
    if let Some(max) = coupon.max_redemptions {
        if coupon.redeemed_count >= max {
            return Err(CoreError::CouponInvalid(format!(
                "coupon {} fully redeemed",
                coupon.code
            )));
        }
    }
    if !coupon.restricted_plan_ids.is_empty() {
        let plan_id = plan_id.ok_or_else(|| {
            CoreError::CouponInvalid(format!(
                "coupon {} is plan-restricted; a plan is required to validate it",
                coupon.code
            ))
        })?;
        if !coupon.restricted_plan_ids.contains(&plan_id) {
            return Err(CoreError::CouponInvalid(format!(
                "coupon {} does not apply to this plan",
                coupon.code
            )));
        }
    }
    Ok(())
}

/// Discount in minor units for a charge. Never exceeds the charge amount
/// and never goes negative.
pub fn discount_for(coupon: &Coupon, amount_minor: i64, currency: &str) -> CoreResult<i64> {
    let raw = match coupon.discount_type {
        DiscountKind::Percent => {
            let pct = coupon.percent_off.ok_or_else(|| {
                CoreError::CouponInvalid(format!("percent coupon {} has no rate", coupon.code))
            })?;
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(CoreError::CouponInvalid(format!(
                    "percent coupon {} has out-of-range rate",
                    coupon.code
                )));
            }
            ((amount_minor as f64) * pct / 100.0).round() as i64
        }
        DiscountKind::Fixed => {
            let table = coupon.fixed_amounts.as_ref().ok_or_else(|| {
                CoreError::CouponInvalid(format!("fixed coupon {} has no amounts", coupon.code))
            })?;
            table
                .get(currency.to_lowercase())
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    CoreError::CouponInvalid(format!(
                        "fixed coupon {} has no amount for {}",
                        coupon.code, currency
                    ))
                })?
        }
    };
    Ok(raw.clamp(0, amount_minor.max(0)))
}

/// One renewal's worth of entitlement consumption: whether the discount
/// applies this period, and the remaining count afterwards. `None` means
/// unlimited and never decrements; `Some(0)` is exhausted and stays there.
pub fn consume_entitlement_period(remaining: Option<i32>) -> (bool, Option<i32>) {
    match remaining {
        None => (true, None),
        Some(n) if n <= 0 => (false, Some(0)),
        Some(n) => (true, Some(n - 1)),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CouponPreview {
    pub code: String,
    pub duration: CouponDuration,
    pub discount_minor: i64,
    pub net_minor: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedemptionResult {
    pub coupon_id: Uuid,
    pub subscription_id: Uuid,
    /// False when the redemption key had already been used and this call
    /// changed nothing.
    pub newly_redeemed: bool,
}

#[derive(Clone)]
pub struct CouponService {
    pool: PgPool,
}

impl CouponService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_code(&self, code: &str) -> CoreResult<Coupon> {
        let coupon: Option<Coupon> = sqlx::query_as(
            r#"
            SELECT id, code, discount_type, percent_off, fixed_amounts, duration,
                   duration_periods, restricted_plan_ids, expires_at,
                   max_redemptions, redeemed_count
            FROM coupons WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        coupon.ok_or_else(|| CoreError::CouponInvalid(format!("coupon {code} not found")))
    }

    /// Validate a coupon against a plan, without redeeming.
    pub async fn validate(
        &self,
        code: &str,
        plan_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
    ) -> CoreResult<Coupon> {
        let coupon = self.fetch_by_code(code).await?;
        evaluate_coupon(&coupon, plan_id, subscription_id, OffsetDateTime::now_utc())?;
        Ok(coupon)
    }

    /// Validate and compute the discount the coupon would apply to a charge.
    pub async fn preview(
        &self,
        code: &str,
        plan_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
        amount_minor: i64,
        currency: &str,
    ) -> CoreResult<CouponPreview> {
        let coupon = self.validate(code, plan_id, subscription_id).await?;
        let discount_minor = discount_for(&coupon, amount_minor, currency)?;
        Ok(CouponPreview {
            code: coupon.code,
            duration: coupon.duration,
            discount_minor,
            net_minor: amount_minor - discount_minor,
        })
    }

    /// Attach a coupon to a subscription, idempotently on `redemption_key`.
    /// A replayed key is a no-op that reports `newly_redeemed: false`; it
    /// never double-increments the redemption counter or stacks a second
    /// entitlement.
    pub async fn redeem(
        &self,
        code: &str,
        subscription_id: Uuid,
        plan_id: Option<Uuid>,
        redemption_key: &str,
    ) -> CoreResult<RedemptionResult> {
        let mut tx = self.pool.begin().await?;

        let coupon: Option<Coupon> = sqlx::query_as(
            r#"
            SELECT id, code, discount_type, percent_off, fixed_amounts, duration,
                   duration_periods, restricted_plan_ids, expires_at,
                   max_redemptions, redeemed_count
            FROM coupons WHERE code = $1
            FOR UPDATE
            "#,
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;
        let coupon = coupon
            .ok_or_else(|| CoreError::CouponInvalid(format!("coupon {code} not found")))?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (id, redemption_key, coupon_id, subscription_id, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (redemption_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(redemption_key)
        .bind(coupon.id)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.commit().await?;
            tracing::debug!(
                code = code,
                subscription_id = %subscription_id,
                "Replayed coupon redemption key, no-op"
            );
            return Ok(RedemptionResult {
                coupon_id: coupon.id,
                subscription_id,
                newly_redeemed: false,
            });
        }

        // Eligibility is checked only for the winning redemption; replays
        // must observe the original outcome even if the coupon has since
        // expired.
        evaluate_coupon(&coupon, plan_id, Some(subscription_id), OffsetDateTime::now_utc())?;

        let already: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM coupon_entitlements WHERE subscription_id = $1 AND coupon_id = $2",
        )
        .bind(subscription_id)
        .bind(coupon.id)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Err(CoreError::CouponInvalid(format!(
                "coupon {} already applied to this subscription",
                coupon.code
            )));
        }

        sqlx::query("UPDATE coupons SET redeemed_count = redeemed_count + 1 WHERE id = $1")
            .bind(coupon.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO coupon_entitlements (id, subscription_id, coupon_id, remaining_periods)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(coupon.id)
        .bind(coupon.initial_remaining_periods()?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            code = %coupon.code,
            subscription_id = %subscription_id,
            "Coupon redeemed"
        );
        Ok(RedemptionResult {
            coupon_id: coupon.id,
            subscription_id,
            newly_redeemed: true,
        })
    }

    /// Consume one billing period's worth of entitlement inside the
    /// caller's renewal transaction, returning the discount in minor units.
    /// Exhausted or absent entitlements yield zero; `remaining_periods`
    /// never goes below zero.
    pub async fn apply_entitlement(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subscription_id: Uuid,
        amount_minor: i64,
        currency: &str,
    ) -> CoreResult<i64> {
        #[derive(sqlx::FromRow)]
        struct EntitledRow {
            entitlement_id: Uuid,
            remaining_periods: Option<i32>,
            #[sqlx(flatten)]
            coupon: Coupon,
        }

        let row: Option<EntitledRow> = sqlx::query_as(
            r#"
            SELECT ce.id AS entitlement_id, ce.remaining_periods,
                   c.id, c.code, c.discount_type, c.percent_off, c.fixed_amounts,
                   c.duration, c.duration_periods, c.restricted_plan_ids,
                   c.expires_at, c.max_redemptions, c.redeemed_count
            FROM coupon_entitlements ce
            JOIN coupons c ON c.id = ce.coupon_id
            WHERE ce.subscription_id = $1
            FOR UPDATE OF ce
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(0);
        };

        let (applies, next) = consume_entitlement_period(row.remaining_periods);
        if !applies {
            return Ok(0);
        }

        let discount = discount_for(&row.coupon, amount_minor, currency)?;

        if next != row.remaining_periods {
            sqlx::query("UPDATE coupon_entitlements SET remaining_periods = $1 WHERE id = $2")
                .bind(next)
                .bind(row.entitlement_id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(discount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn percent(code: &str, pct: f64) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            code: code.to_string(),
            discount_type: DiscountKind::Percent,
            percent_off: Some(pct),
            fixed_amounts: None,
            duration: CouponDuration::Once,
            duration_periods: None,
            restricted_plan_ids: vec![],
            expires_at: None,
            max_redemptions: None,
            redeemed_count: 0,
        }
    }

    fn fixed(code: &str, amounts: Value) -> Coupon {
        Coupon {
            discount_type: DiscountKind::Fixed,
            percent_off: None,
            fixed_amounts: Some(amounts),
            ..percent(code, 0.0)
        }
    }

    #[test]
    fn percent_discount_rounds_and_caps() {
        let c = percent("HALF", 50.0);
        assert_eq!(discount_for(&c, 999, "usd").unwrap(), 500);

        let c = percent("ALL", 100.0);
        assert_eq!(discount_for(&c, 1000, "usd").unwrap(), 1000);
    }

    #[test]
    fn fixed_discount_is_per_currency_and_capped() {
        let c = fixed("SAVE5", serde_json::json!({"usd": 500, "eur": 450}));
        assert_eq!(discount_for(&c, 1000, "usd").unwrap(), 500);
        assert_eq!(discount_for(&c, 1000, "EUR").unwrap(), 450);
        // Discount never exceeds the charge.
        assert_eq!(discount_for(&c, 300, "usd").unwrap(), 300);
        // No amount for the charge currency: invalid, not zero.
        assert!(matches!(
            discount_for(&c, 1000, "gbp").unwrap_err(),
            CoreError::CouponInvalid(_)
        ));
    }

    #[test]
    fn expired_and_exhausted_coupons_are_rejected() {
        let now = OffsetDateTime::now_utc();

        let mut c = percent("OLD", 10.0);
        c.expires_at = Some(now - Duration::days(1));
        assert!(evaluate_coupon(&c, None, None, now).is_err());

        let mut c = percent("GONE", 10.0);
        c.max_redemptions = Some(100);
        c.redeemed_count = 100;
        assert!(evaluate_coupon(&c, None, None, now).is_err());
    }

    #[test]
    fn plan_restriction_requires_a_matching_plan() {
        let now = OffsetDateTime::now_utc();
        let plan_a = Uuid::new_v4();
        let plan_b = Uuid::new_v4();

        let mut c = percent("PRO_ONLY", 20.0);
        c.restricted_plan_ids = vec![plan_a];

        assert!(evaluate_coupon(&c, Some(plan_a), None, now).is_ok());
        assert!(evaluate_coupon(&c, Some(plan_b), None, now).is_err());
        // Restricted coupon with no plan context cannot be validated.
        assert!(evaluate_coupon(&c, None, None, now).is_err());
    }

    #[test]
    fn forever_coupon_requires_subscription_context() {
        let now = OffsetDateTime::now_utc();
        let mut c = percent("LIFETIME", 10.0);
        c.duration = CouponDuration::Forever;

        // Anonymous validation has nothing for the coupon to attach to.
        assert!(matches!(
            evaluate_coupon(&c, Some(Uuid::new_v4()), None, now).unwrap_err(),
            CoreError::CouponInvalid(_)
        ));
        assert!(evaluate_coupon(&c, Some(Uuid::new_v4()), Some(Uuid::new_v4()), now).is_ok());

        // Bounded durations validate fine without one.
        let c = percent("ONCE", 10.0);
        assert!(evaluate_coupon(&c, None, None, now).is_ok());
    }

    #[test]
    fn entitlement_consumption_exhausts_bounded_durations() {
        // Repeating over three periods: three discounts, then nothing.
        let mut remaining = Some(3);
        let mut applied = 0;
        for _ in 0..5 {
            let (applies, next) = consume_entitlement_period(remaining);
            if applies {
                applied += 1;
            }
            remaining = next;
        }
        assert_eq!(applied, 3);
        assert_eq!(remaining, Some(0));

        // Once is a single period.
        assert_eq!(consume_entitlement_period(Some(1)), (true, Some(0)));
        assert_eq!(consume_entitlement_period(Some(0)), (false, Some(0)));

        // Forever never decrements.
        assert_eq!(consume_entitlement_period(None), (true, None));
    }

    #[test]
    fn repeating_coupon_requires_period_count() {
        let mut c = percent("REPEAT", 10.0);
        c.duration = CouponDuration::Repeating;
        assert!(c.initial_remaining_periods().is_err());
        c.duration_periods = Some(3);
        assert_eq!(c.initial_remaining_periods().unwrap(), Some(3));

        let mut c = percent("FOREVER", 10.0);
        c.duration = CouponDuration::Forever;
        assert_eq!(c.initial_remaining_periods().unwrap(), None);
    }

    #[test]
    fn out_of_range_percent_is_rejected() {
        assert!(discount_for(&percent("NEG", -5.0), 1000, "usd").is_err());
        assert!(discount_for(&percent("BIG", 150.0), 1000, "usd").is_err());
        assert!(discount_for(&percent("NAN", f64::NAN), 1000, "usd").is_err());
    }
}
