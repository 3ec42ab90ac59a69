//! Qalam Points Worker
//!
//! Handles scheduled jobs including:
//! - Subscription cycle sweep (every 15 minutes)
//! - Nightly wallet reconciliation (daily at 02:10 UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use qalam_points::{LedgerStore, ReconciliationJob, SubscriptionService};
use qalam_shared::PointsConfig;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
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

    info!("Starting Qalam Points Worker");

    let pool = create_db_pool().await?;
    let config = Arc::new(PointsConfig::from_env()?);

    let ledger = LedgerStore::new(pool.clone(), config.allow_negative_balance);
    let subscriptions = SubscriptionService::new(pool, ledger.clone(), config.clone());
    let reconciliation = ReconciliationJob::new(ledger);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Subscription cycle sweep (every 15 minutes)
    // Credits every active subscription whose next_credit_at has passed.
    let sweep_service = subscriptions.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                info!("Running subscription cycle sweep");
                match service.credit_all_due(OffsetDateTime::now_utc()).await {
                    Ok(summary) => info!(
                        due = summary.due,
                        credited = summary.credited,
                        skipped = summary.skipped,
                        failed = summary.failed,
                        points_granted = summary.points_granted,
                        "Subscription cycle sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Subscription cycle sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription cycle sweep (every 15 minutes)");

    // Job 2: Nightly wallet reconciliation (daily at 02:10 UTC)
    // Runs after midnight so the full previous day is settled.
    if config.reconciliation_enabled {
        let reconciliation_job = reconciliation.clone();
        scheduler
            .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
                let job = reconciliation_job.clone();
                Box::pin(async move {
                    info!("Running nightly wallet reconciliation");
                    match job.run_sweep().await {
                        Ok(summary) => info!(
                            run_date = %summary.run_date,
                            checked = summary.checked,
                            clean = summary.clean,
                            adjusted = summary.adjusted,
                            skipped = summary.skipped,
                            errors = summary.errors,
                            total_abs_drift = summary.total_abs_drift,
                            "Reconciliation sweep complete"
                        ),
                        Err(e) => error!(error = %e, "Reconciliation sweep failed"),
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Wallet reconciliation (daily at 02:10 UTC)");
    } else {
        warn!("Reconciliation disabled via config (RECONCILIATION_ENABLED=false)");
    }

    // Job 3: Health check heartbeat (every 5 minutes)
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

    info!("Qalam Points Worker started successfully");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
