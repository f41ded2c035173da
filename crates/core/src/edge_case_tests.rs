//! Edge case tests across module boundaries
//!
//! Covers the concurrency and boundary conditions that individual module
//! tests don't exercise: racing ledger claims, duplicate deliveries under
//! contention, proration at period boundaries, and past-due episode
//! accounting over realistic event sequences.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::coupons::{discount_for, Coupon, CouponDuration, DiscountKind};
use crate::proration::{compute_proration, BillingFrequency, PlanPricing, Price};
use crate::subscriptions::{past_due_since_after, GatewayEventType, SubscriptionStatus};
use crate::webhooks::{ClaimOutcome, MemWebhookLedger, ReleaseOutcome, WebhookLedger};

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

// ---------------------------------------------------------------------------
// Ledger claim races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_claims_grant_exactly_one_lease() {
    let ledger = Arc::new(MemWebhookLedger::new(Duration::from_secs(60)));
    ledger.record("gw", "evt_race", b"{}").await.unwrap();

    let barrier = Arc::new(Barrier::new(10));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            ledger.claim("gw", "evt_race").await.unwrap()
        }));
    }

    let mut granted = 0;
    let mut held = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::Granted => granted += 1,
            ClaimOutcome::LeaseHeld => held += 1,
            ClaimOutcome::AlreadyProcessed => panic!("nothing processed yet"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(held, 9);
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_converge_on_one_row() {
    let ledger = Arc::new(MemWebhookLedger::new(Duration::from_secs(60)));

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            ledger.record("gw", "evt_dup", b"{\"n\":1}").await.unwrap()
        }));
    }
    let mut newly_recorded = 0;
    for handle in handles {
        // Every delivery records cleanly; none observes a processed effect.
        let outcome = handle.await.unwrap();
        assert!(!outcome.already_processed);
        if outcome.newly_recorded {
            newly_recorded += 1;
        }
    }
    // Exactly one delivery created the row; the rest were duplicates.
    assert_eq!(newly_recorded, 1);

    // One claim wins, processes, and every later delivery is a no-op.
    assert_eq!(
        ledger.claim("gw", "evt_dup").await.unwrap(),
        ClaimOutcome::Granted
    );
    ledger
        .release("gw", "evt_dup", ReleaseOutcome::Processed)
        .await
        .unwrap();
    assert!(ledger
        .record("gw", "evt_dup", b"{\"n\":1}")
        .await
        .unwrap()
        .already_processed);
}

#[tokio::test]
async fn failed_then_retried_event_processes_exactly_once() {
    let ledger = MemWebhookLedger::new(Duration::from_secs(60));
    ledger.record("gw", "evt_retry", b"{}").await.unwrap();

    // First attempt fails transiently.
    assert_eq!(
        ledger.claim("gw", "evt_retry").await.unwrap(),
        ClaimOutcome::Granted
    );
    ledger
        .release(
            "gw",
            "evt_retry",
            ReleaseOutcome::RetryLater {
                error: "gateway 503".to_string(),
            },
        )
        .await
        .unwrap();

    // Retry loop sees it, claims, succeeds.
    let eligible = ledger.retry_eligible(10).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].last_error.as_deref(), Some("gateway 503"));

    assert_eq!(
        ledger.claim("gw", "evt_retry").await.unwrap(),
        ClaimOutcome::Granted
    );
    ledger
        .release("gw", "evt_retry", ReleaseOutcome::Processed)
        .await
        .unwrap();

    // No further attempt is possible.
    assert_eq!(
        ledger.claim("gw", "evt_retry").await.unwrap(),
        ClaimOutcome::AlreadyProcessed
    );
    assert!(ledger.retry_eligible(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn expire_stale_claims_reopens_crashed_workers_events() {
    let ledger = MemWebhookLedger::new(Duration::from_millis(10));
    ledger.record("gw", "evt_crash", b"{}").await.unwrap();
    assert_eq!(
        ledger.claim("gw", "evt_crash").await.unwrap(),
        ClaimOutcome::Granted
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ledger.expire_stale_claims().await.unwrap(), 1);
    assert_eq!(
        ledger.claim("gw", "evt_crash").await.unwrap(),
        ClaimOutcome::Granted
    );
}

// ---------------------------------------------------------------------------
// Proration boundaries
// ---------------------------------------------------------------------------

#[test]
fn proration_at_exact_cycle_end_is_zero() {
    let now = OffsetDateTime::now_utc();
    let delta = compute_proration(
        &plan(BillingFrequency::Monthly, 10_000),
        now,
        &plan(BillingFrequency::Monthly, 50_000),
        "usd",
        0.2,
        now,
    )
    .unwrap();
    assert_eq!(delta.amount_minor, 0);
    assert_eq!(delta.tax_minor, 0);
}

#[test]
fn proration_handles_enterprise_scale_prices_without_overflow() {
    let now = OffsetDateTime::now_utc();
    let cycle_end = now + time::Duration::days(200);
    // Yearly plans priced in the millions of minor units.
    let delta = compute_proration(
        &plan(BillingFrequency::Yearly, 12_000_000),
        cycle_end,
        &plan(BillingFrequency::Yearly, 48_000_000),
        "usd",
        0.0,
        now,
    )
    .unwrap();
    // (48M - 12M) / 365 * 200, rounded.
    let expected = ((48_000_000.0 - 12_000_000.0) / 365.0 * 200.0_f64).round() as i64;
    assert_eq!(delta.amount_minor, expected);
}

// ---------------------------------------------------------------------------
// Coupon discount boundaries
// ---------------------------------------------------------------------------

#[test]
fn discount_on_zero_amount_charge_is_zero() {
    let coupon = Coupon {
        id: Uuid::new_v4(),
        code: "ZERO".to_string(),
        discount_type: DiscountKind::Percent,
        percent_off: Some(50.0),
        fixed_amounts: None,
        duration: CouponDuration::Forever,
        duration_periods: None,
        restricted_plan_ids: vec![],
        expires_at: None,
        max_redemptions: None,
        redeemed_count: 0,
    };
    assert_eq!(discount_for(&coupon, 0, "usd").unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Past-due episodes across realistic event sequences
// ---------------------------------------------------------------------------

#[test]
fn two_past_due_episodes_get_independent_stamps() {
    let t0 = OffsetDateTime::now_utc();
    let t1 = t0 + time::Duration::days(1);
    let t2 = t0 + time::Duration::days(2);
    let t3 = t0 + time::Duration::days(30);

    let mut status = SubscriptionStatus::Active;
    let mut stamp = None;

    // Episode one: fail, fail again, recover.
    for (event, at) in [
        ("payment.failed", t0),
        ("invoice.payment_failed", t1),
        ("payment.succeeded", t2),
    ] {
        let next = GatewayEventType::parse(event).asserted_status().unwrap();
        stamp = past_due_since_after(status, stamp, next, at);
        status = next;
    }
    assert_eq!(status, SubscriptionStatus::Active);
    assert_eq!(stamp, None);

    // Episode two a month later: the stamp is t3, not t0.
    let next = GatewayEventType::parse("payment.failed")
        .asserted_status()
        .unwrap();
    stamp = past_due_since_after(status, stamp, next, t3);
    assert_eq!(stamp, Some(t3));
}

#[test]
fn cancellation_clears_past_due_episode() {
    let now = OffsetDateTime::now_utc();
    let stamp = past_due_since_after(
        SubscriptionStatus::PastDue,
        Some(now - time::Duration::days(5)),
        SubscriptionStatus::Cancelled,
        now,
    );
    assert_eq!(stamp, None);
}
