//! Pagemint Background Worker
//!
//! Drives the scheduled billing sweeps:
//! - Renewal sweep: renew due resources or lapse unfunded ones (hourly)
//! - Expiry sweep: expire overdue resources, no funds involved (daily)
//! - Pre-expiry warning sweep: deduped owner notifications (daily)
//! - Ledger invariant checks (daily at 5:15 UTC)

use std::sync::Arc;
use std::time::Duration;

use pagemint_billing::{BillingService, ExpirySummary, InvariantChecker, SweepSummary, WarningSummary};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a renewal sweep
fn log_renewal_summary(summary: &SweepSummary) {
    info!(
        renewed = summary.renewed.len(),
        expired = summary.expired.len(),
        skipped = summary.skipped,
        errors = summary.errors.len(),
        "Renewal sweep cycle complete"
    );
    for err in &summary.errors {
        error!(resource_id = %err.resource_id, error = %err.error, "Renewal attempt failed");
    }
}

fn log_expiry_summary(summary: &ExpirySummary) {
    info!(
        expired = summary.expired.len(),
        errors = summary.errors.len(),
        "Expiry sweep cycle complete"
    );
    for err in &summary.errors {
        error!(resource_id = %err.resource_id, error = %err.error, "Expiry transition failed");
    }
}

fn log_warning_summary(summary: &WarningSummary) {
    info!(
        notified = summary.notified,
        deduped = summary.deduped,
        errors = summary.errors.len(),
        "Warning sweep cycle complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Pagemint Worker");

    // Create database pool and apply schema migrations
    let pool = create_db_pool().await?;
    pagemint_billing::run_migrations(&pool).await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!(error = %e, "Failed to create billing service");
            return Err(e.into());
        }
    };
    let config = pagemint_shared::BillingConfig::from_env()?;

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Renewal sweep (hourly by default)
    // Renews every due resource; lapses the ones their owners cannot fund.
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.renewal_sweep_schedule.as_str(),
            move |_uuid, _l| {
                let billing = renewal_billing.clone();
                Box::pin(async move {
                    info!("Running scheduled renewal sweep");
                    match billing.renewals.run_renewal_sweep().await {
                        Ok(summary) => log_renewal_summary(&summary),
                        Err(e) => error!(error = %e, "Renewal sweep failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(schedule = %config.renewal_sweep_schedule, "Scheduled: Renewal sweep");

    // Job 2: Expiry sweep (daily by default)
    // Expires any active resource past its expiry, regardless of auto-renew.
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.expiry_sweep_schedule.as_str(),
            move |_uuid, _l| {
                let billing = expiry_billing.clone();
                Box::pin(async move {
                    info!("Running scheduled expiry sweep");
                    match billing.renewals.run_expiry_sweep().await {
                        Ok(summary) => log_expiry_summary(&summary),
                        Err(e) => error!(error = %e, "Expiry sweep failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(schedule = %config.expiry_sweep_schedule, "Scheduled: Expiry sweep");

    // Job 3: Pre-expiry warning sweep (daily by default)
    // At most one warning of a given type per resource per day.
    let warning_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.warning_sweep_schedule.as_str(),
            move |_uuid, _l| {
                let billing = warning_billing.clone();
                Box::pin(async move {
                    info!("Running scheduled warning sweep");
                    match billing.renewals.run_warning_sweep().await {
                        Ok(summary) => log_warning_summary(&summary),
                        Err(e) => error!(error = %e, "Warning sweep failed"),
                    }
                })
            },
        )?)
        .await?;
    info!(schedule = %config.warning_sweep_schedule, "Scheduled: Warning sweep");

    // Job 4: Ledger invariant checks (daily at 5:15 UTC)
    // Read-only consistency checks over balances, ledger and renewal state.
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 15 5 * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "All ledger invariants hold");
                    }
                    Ok(summary) => {
                        warn!(
                            failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Ledger invariant violations found"
                        );
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Invariant violation"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 5:15 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Pagemint Worker started successfully with 5 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
