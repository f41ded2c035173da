//! Proration math
//!
//! Computes the billing delta when a subscription moves between plans
//! mid-period. Deterministic and side-effect-free on purpose: the same
//! function backs both the read-only preview endpoint and the
//! invoice-issuing commit path, so the two can never drift apart.
//!
//! Each plan is priced against its *own* cycle length (30 days monthly,
//! 365 days yearly). Monthly→yearly and yearly→monthly changes therefore
//! use independent denominators, never a blended one.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    Monthly,
    Yearly,
}

impl BillingFrequency {
    /// Cycle length in days used as the daily-rate denominator. A property
    /// of the plan being priced, not shared between source and destination.
    pub fn cycle_days(self) -> f64 {
        match self {
            BillingFrequency::Monthly => 30.0,
            BillingFrequency::Yearly => 365.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BillingFrequency::Monthly => "monthly",
            BillingFrequency::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "monthly" => Ok(BillingFrequency::Monthly),
            "yearly" => Ok(BillingFrequency::Yearly),
            other => Err(CoreError::InvalidInput(format!(
                "unknown billing frequency: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One price point: integer minor-currency units for a (currency, frequency)
/// pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub currency: String,
    pub frequency: BillingFrequency,
    pub amount_minor: i64,
}

/// The pricing view of a plan needed for proration: its own billing
/// frequency, its version (snapshotted onto invoices), and its price list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPricing {
    pub plan_id: Uuid,
    pub frequency: BillingFrequency,
    pub version: i32,
    pub prices: Vec<Price>,
}

impl PlanPricing {
    /// Resolve the price for this plan's own (currency, frequency) tuple.
    /// Missing price is a hard failure, never a silent zero.
    pub fn price_for(&self, currency: &str) -> CoreResult<i64> {
        self.prices
            .iter()
            .find(|p| p.currency.eq_ignore_ascii_case(currency) && p.frequency == self.frequency)
            .map(|p| p.amount_minor)
            .ok_or_else(|| CoreError::PriceUnavailable {
                plan_id: self.plan_id,
                currency: currency.to_string(),
                frequency: self.frequency.as_str().to_string(),
            })
    }
}

/// Result of a proration computation, in minor currency units. Negative
/// amounts are credits (downgrades).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationDelta {
    pub amount_minor: i64,
    pub tax_minor: i64,
}

/// Normalize a tax rate that may arrive as a 0–1 fraction or a 0–100
/// percentage. Always returns a fraction clamped to [0, 1].
pub fn normalize_tax_rate(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
    fraction.clamp(0.0, 1.0)
}

/// Compute the proration delta for switching from `current` to `next` with
/// the current cycle ending at `cycle_end`, evaluated at `at`.
///
/// `tax_rate` accepts either a fraction or a percentage (normalized here).
pub fn compute_proration(
    current: &PlanPricing,
    cycle_end: OffsetDateTime,
    next: &PlanPricing,
    currency: &str,
    tax_rate: f64,
    at: OffsetDateTime,
) -> CoreResult<ProrationDelta> {
    // Price resolution fails before any arithmetic. The destination plan
    // must also carry a positive price: a zero or negative destination price
    // means the catalog is misconfigured, not that the change is free.
    let current_price = current.price_for(currency)?;
    let next_price = next.price_for(currency)?;
    if next_price <= 0 {
        return Err(CoreError::PriceUnavailable {
            plan_id: next.plan_id,
            currency: currency.to_string(),
            frequency: next.frequency.as_str().to_string(),
        });
    }

    let remaining_days = ((cycle_end - at).as_seconds_f64() / SECONDS_PER_DAY).max(0.0);
    if remaining_days == 0.0 {
        return Ok(ProrationDelta {
            amount_minor: 0,
            tax_minor: 0,
        });
    }

    let old_daily = current_price as f64 / current.frequency.cycle_days();
    let new_daily = next_price as f64 / next.frequency.cycle_days();

    let amount_minor = ((new_daily - old_daily) * remaining_days).round() as i64;
    let tax_minor = (amount_minor as f64 * normalize_tax_rate(tax_rate)).round() as i64;

    Ok(ProrationDelta {
        amount_minor,
        tax_minor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn plan(frequency: BillingFrequency, amount: i64) -> PlanPricing {
        PlanPricing {
            plan_id: Uuid::new_v4(),
            frequency,
            version: 1,
            prices: vec![Price {
                currency: "usd".to_string(),
                frequency,
                amount_minor: amount,
            }],
        }
    }

    #[test]
    fn downgrade_mid_month_yields_expected_credit() {
        // Monthly 1000 -> monthly 500 with 15 days remaining:
        // round((500/30 - 1000/30) * 15) = -250
        let now = OffsetDateTime::now_utc();
        let cycle_end = now + Duration::days(15);
        let delta = compute_proration(
            &plan(BillingFrequency::Monthly, 1000),
            cycle_end,
            &plan(BillingFrequency::Monthly, 500),
            "usd",
            0.18,
            now,
        )
        .unwrap();
        assert_eq!(delta.amount_minor, -250);
        assert_eq!(delta.tax_minor, (-250.0_f64 * 0.18).round() as i64);
    }

    #[test]
    fn upgrade_is_non_negative_and_downgrade_non_positive() {
        let now = OffsetDateTime::now_utc();
        let cycle_end = now + Duration::days(10);
        let cheap = plan(BillingFrequency::Monthly, 900);
        let pricey = plan(BillingFrequency::Monthly, 4500);

        let up = compute_proration(&cheap, cycle_end, &pricey, "usd", 0.0, now).unwrap();
        assert!(up.amount_minor >= 0);

        let down = compute_proration(&pricey, cycle_end, &cheap, "usd", 0.0, now).unwrap();
        assert!(down.amount_minor <= 0);
    }

    #[test]
    fn zero_remaining_days_is_exactly_zero() {
        let now = OffsetDateTime::now_utc();
        let delta = compute_proration(
            &plan(BillingFrequency::Monthly, 99_999),
            now - Duration::days(3),
            &plan(BillingFrequency::Monthly, 5),
            "usd",
            0.25,
            now,
        )
        .unwrap();
        assert_eq!(delta.amount_minor, 0);
        assert_eq!(delta.tax_minor, 0);
    }

    #[test]
    fn cycle_length_is_per_plan_not_blended() {
        let now = OffsetDateTime::now_utc();
        let cycle_end = now + Duration::days(30);
        let monthly = plan(BillingFrequency::Monthly, 3000); // 100/day
        let yearly = plan(BillingFrequency::Yearly, 36_500); // 100/day

        let same_rate = compute_proration(&monthly, cycle_end, &yearly, "usd", 0.0, now).unwrap();
        assert_eq!(same_rate.amount_minor, 0);

        // Doubling only the yearly price doubles only the destination daily
        // rate; the source denominator is untouched.
        let yearly_double = plan(BillingFrequency::Yearly, 73_000); // 200/day
        let up = compute_proration(&monthly, cycle_end, &yearly_double, "usd", 0.0, now).unwrap();
        assert_eq!(up.amount_minor, 3000);
    }

    #[test]
    fn missing_price_fails_instead_of_defaulting() {
        let now = OffsetDateTime::now_utc();
        let cycle_end = now + Duration::days(5);
        let src = plan(BillingFrequency::Monthly, 1000);
        let mut dst = plan(BillingFrequency::Monthly, 1000);
        dst.prices.clear();

        let err = compute_proration(&src, cycle_end, &dst, "usd", 0.0, now).unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));

        // Wrong currency on the source side fails the same way.
        let err = compute_proration(&src, cycle_end, &src, "eur", 0.0, now).unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }

    #[test]
    fn non_positive_destination_price_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let cycle_end = now + Duration::days(5);
        let src = plan(BillingFrequency::Monthly, 1000);
        let dst = plan(BillingFrequency::Monthly, 0);
        let err = compute_proration(&src, cycle_end, &dst, "usd", 0.0, now).unwrap_err();
        assert!(matches!(err, CoreError::PriceUnavailable { .. }));
    }

    #[test]
    fn tax_rate_normalization_accepts_fraction_and_percent() {
        assert_eq!(normalize_tax_rate(0.18), 0.18);
        assert_eq!(normalize_tax_rate(18.0), 0.18);
        assert_eq!(normalize_tax_rate(-0.5), 0.0);
        assert_eq!(normalize_tax_rate(250.0), 1.0);
        assert_eq!(normalize_tax_rate(f64::NAN), 0.0);
    }
}
