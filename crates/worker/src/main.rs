//! Stratabill Background Worker
//!
//! Scheduled jobs:
//! - Re-drive retry-eligible webhook events (every minute)
//! - Expire stale processing leases (every 5 minutes)
//! - Sweep idle dedicated connection pools (every 5 minutes)
//! - Expire lapsed subscription trials (hourly)
//! - Run engine invariant checks (daily at 2:00 UTC)
//! - Prune processed ledger rows past retention (daily at 3:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use stratabill_core::{EngineServices, WebhookEnvelope};

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// One pass of the retry loop: claim and drive every retry-eligible ledger
/// row. Claim losers are skipped silently; a row whose payload no longer
/// parses is counted and left for the next invariant run to surface.
async fn redrive_pending(engine: &EngineServices) {
    let rows = match engine.ledger.retry_eligible(50).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to list retry-eligible webhook events");
            return;
        }
    };
    if rows.is_empty() {
        return;
    }

    let total = rows.len();
    let mut driven = 0;
    let mut failed = 0;

    for row in rows {
        let raw = match serde_json::to_vec(&row.payload) {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    provider = %row.provider,
                    event_id = %row.external_event_id,
                    error = %e,
                    "Stored payload unserializable, skipping"
                );
                failed += 1;
                continue;
            }
        };
        let envelope = match WebhookEnvelope::parse(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    provider = %row.provider,
                    event_id = %row.external_event_id,
                    error = %e,
                    "Stored payload no longer parses as an envelope"
                );
                failed += 1;
                continue;
            }
        };

        match engine
            .ledger
            .claim(&row.provider, &row.external_event_id)
            .await
        {
            Ok(stratabill_core::ClaimOutcome::Granted) => {}
            Ok(_) => continue,
            Err(e) => {
                error!(
                    provider = %row.provider,
                    event_id = %row.external_event_id,
                    error = %e,
                    "Failed to claim event for retry"
                );
                failed += 1;
                continue;
            }
        }

        match engine.processor.drive_claimed(&row.provider, &envelope).await {
            Ok(_) => driven += 1,
            Err(e) => {
                warn!(
                    provider = %row.provider,
                    event_id = %row.external_event_id,
                    error = %e,
                    "Retry attempt failed"
                );
                failed += 1;
            }
        }
    }

    info!(
        total = total,
        driven = driven,
        failed = failed,
        "Webhook retry pass complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Stratabill Worker");

    let pool = create_db_pool().await?;
    let engine = Arc::new(EngineServices::from_env(pool).await?);
    let retention_days = engine.config.ledger_retention_days;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Re-drive retry-eligible webhook events (every minute)
    let retry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let engine = retry_engine.clone();
            Box::pin(async move {
                redrive_pending(&engine).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook retry loop (every minute)");

    // Job 2: Expire stale processing leases (every 5 minutes)
    // Safety net on top of claim-time takeover: flips abandoned rows back
    // to retry-eligible even when no new delivery arrives for them.
    let expiry_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let engine = expiry_engine.clone();
            Box::pin(async move {
                match engine.ledger.expire_stale_claims().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired = expired, "Expired stale webhook leases"),
                    Err(e) => error!(error = %e, "Stale lease expiry failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale lease expiry (every 5 minutes)");

    // Job 3: Sweep idle dedicated connection pools (every 5 minutes)
    let sweep_engine = engine.clone();
    scheduler
        .add(Job::new_async("30 */5 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                let evicted = engine.lease_cache.sweep_idle().await;
                if evicted > 0 {
                    info!(evicted = evicted, "Swept idle dedicated pools");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Idle pool sweep (every 5 minutes)");

    // Job 4: Expire lapsed subscription trials (hourly)
    let trial_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let engine = trial_engine.clone();
            Box::pin(async move {
                match engine.subscriptions.expire_trials().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired = expired, "Expired lapsed trials"),
                    Err(e) => error!(error = %e, "Trial expiry pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry (hourly)");

    // Job 5: Invariant checks (daily at 2:00 UTC)
    let invariant_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let engine = invariant_engine.clone();
            Box::pin(async move {
                info!("Running engine invariant checks");
                match engine.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "All invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                tenants = ?violation.tenant_ids,
                                "{}",
                                violation.description
                            );
                        }
                        error!(
                            failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Invariant violations detected"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 2:00 UTC)");

    // Job 6: Prune processed ledger rows past retention (daily at 3:00 UTC)
    let prune_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let engine = prune_engine.clone();
            Box::pin(async move {
                match engine.ledger.prune_processed(retention_days).await {
                    Ok(pruned) => info!(
                        pruned = pruned,
                        retention_days = retention_days,
                        "Ledger retention pass complete"
                    ),
                    Err(e) => error!(error = %e, "Ledger retention pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger retention prune (daily at 3:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Stratabill Worker started successfully with 6 scheduled jobs");

    // The scheduler runs jobs in background tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
