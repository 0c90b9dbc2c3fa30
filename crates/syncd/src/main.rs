//! Subscription-access sync daemon.
//!
//! Runs the scheduling loop against Postgres when `DATABASE_URL` is set,
//! or against in-memory stores for local development. Stops cleanly on
//! ctrl-c: no new ticks, in-flight dispatch drains, then exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use streamgate_infra::notify::TracingNotifier;
use streamgate_infra::sync_jobs::{
    InMemoryJobStore, JobStore, PostgresEntitlementStore, PostgresErrorLogStore, PostgresJobStore,
    SchedulerConfig, SyncScheduler, ensure_schema,
};
use streamgate_sync::{
    AccessReconciler, EntitlementStore, ErrorClassifier, ErrorLogStore, InMemoryEntitlementStore,
    InMemoryErrorLogStore, RetryPolicy,
};

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable value; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Comma-separated seconds, e.g. `SYNC_BACKOFF_SCHEDULE=300,900,3600`.
fn backoff_schedule() -> Vec<Duration> {
    let default = vec![
        Duration::from_secs(5 * 60),
        Duration::from_secs(15 * 60),
        Duration::from_secs(60 * 60),
    ];
    let Ok(raw) = std::env::var("SYNC_BACKOFF_SCHEDULE") else {
        return default;
    };
    let parsed: Option<Vec<Duration>> = raw
        .split(',')
        .map(|s| s.trim().parse::<u64>().ok().map(Duration::from_secs))
        .collect();
    match parsed {
        Some(schedule) if !schedule.is_empty() => schedule,
        _ => {
            tracing::warn!(value = %raw, "unparseable SYNC_BACKOFF_SCHEDULE; using default");
            default
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamgate_observability::init();

    let config = SchedulerConfig::default()
        .with_tick_interval(Duration::from_secs(env_u64("SYNC_TICK_INTERVAL_SECS", 60)))
        .with_batch_size(env_u64("SYNC_BATCH_SIZE", 8) as usize)
        .with_reconcile_timeout(Duration::from_secs(env_u64("SYNC_RECONCILE_TIMEOUT_SECS", 30)));
    let retry = RetryPolicy::new(env_u64("SYNC_MAX_ATTEMPTS", 3) as u32, backoff_schedule());

    let (jobs, entitlements, logs): (
        Arc<dyn JobStore>,
        Arc<dyn EntitlementStore>,
        Arc<dyn ErrorLogStore>,
    ) = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(env_u64("SYNC_DB_MAX_CONNECTIONS", 5) as u32)
                .connect(&url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            ensure_schema(&pool)
                .await
                .context("failed to bootstrap schema")?;
            (
                Arc::new(PostgresJobStore::new(pool.clone())),
                Arc::new(PostgresEntitlementStore::new(pool.clone())),
                Arc::new(PostgresErrorLogStore::new(pool)),
            )
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores (dev only, state dies with the process)");
            (
                InMemoryJobStore::arc(),
                InMemoryEntitlementStore::arc(),
                Arc::new(InMemoryErrorLogStore::new()),
            )
        }
    };

    let scheduler = SyncScheduler::new(
        jobs,
        AccessReconciler::new(entitlements),
        ErrorClassifier::new(logs, Arc::new(TracingNotifier::new())),
        retry,
        config,
    );
    let handle = scheduler.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received; draining in-flight work");
    handle.shutdown().await;

    Ok(())
}
