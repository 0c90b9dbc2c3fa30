//! Tick-driven scheduler and worker pool.
//!
//! A single loop claims eligible jobs on a fixed interval and fans them
//! out, one task per job, bounded by the batch size. The tick is
//! single-flight: dispatch is awaited before the next tick is taken, and
//! a timer fire that lands while dispatch is still running is skipped
//! entirely rather than queued. Reconciliation errors are caught at the
//! per-job boundary; nothing propagates to the loop, which runs for the
//! lifetime of the process until a graceful shutdown is requested.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use streamgate_sync::{
    AccessReconciler, ErrorClassifier, ReconcileError, RetryPolicy, SyncJob,
};

use super::store::JobStore;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop looks for eligible jobs
    pub tick_interval: Duration,
    /// Maximum jobs claimed (and therefore dispatched) per tick
    pub batch_size: usize,
    /// Per-reconciliation time budget; overrunning it is a transient failure
    pub reconcile_timeout: Duration,
    /// Claims older than this are released back to `Pending` at the start
    /// of each tick; `None` disables the sweep
    pub stale_claim_after: Option<Duration>,
    /// Name for logging
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            batch_size: 8,
            reconcile_timeout: Duration::from_secs(30),
            stale_claim_after: Some(Duration::from_secs(10 * 60)),
            name: "sync-scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_stale_claim_after(mut self, after: Option<Duration>) -> Self {
        self.stale_claim_after = after;
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed_permanently: u64,
    pub stale_reclaims: u64,
}

/// Outcome of one dispatched job, for bookkeeping.
enum JobOutcome {
    Succeeded,
    Retried,
    FailedPermanently,
}

/// Handle to control a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown: stop taking new ticks, wait for
    /// in-flight dispatch to finish, then return.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Snapshot of the scheduler's counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Claims eligible sync jobs and drives them through reconciliation.
pub struct SyncScheduler {
    store: Arc<dyn JobStore>,
    reconciler: AccessReconciler,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    config: SchedulerConfig,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        reconciler: AccessReconciler,
        classifier: ErrorClassifier,
        retry: RetryPolicy,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            classifier,
            retry,
            config,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    /// Snapshot of the scheduler's counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run one scheduling tick: sweep stale claims, claim a batch, fan
    /// out, fan in. Never returns an error; every failure on this path is
    /// recorded and contained.
    pub async fn run_tick(&self) {
        if let Some(stale_after) = self.config.stale_claim_after {
            self.sweep_stale_claims(stale_after).await;
        }

        let batch = match self.store.claim_batch(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(scheduler = %self.config.name, error = %e, "claim failed; skipping tick");
                return;
            }
        };

        let claimed = batch.len();
        if claimed > 0 {
            debug!(scheduler = %self.config.name, claimed, "dispatching batch");
        }

        let mut handles: Vec<JoinHandle<JobOutcome>> = Vec::with_capacity(claimed);
        for job in batch {
            let store = self.store.clone();
            let reconciler = self.reconciler.clone();
            let classifier = self.classifier.clone();
            let retry = self.retry.clone();
            let budget = self.config.reconcile_timeout;
            handles.push(tokio::spawn(async move {
                process_job(store, reconciler, classifier, retry, budget, job).await
            }));
        }

        // Fan-in: one job's failure never cancels or affects its siblings.
        let mut succeeded = 0u64;
        let mut retried = 0u64;
        let mut failed = 0u64;
        for handle in handles {
            match handle.await {
                Ok(JobOutcome::Succeeded) => succeeded += 1,
                Ok(JobOutcome::Retried) => retried += 1,
                Ok(JobOutcome::FailedPermanently) => failed += 1,
                Err(e) => error!(scheduler = %self.config.name, error = %e, "job task panicked"),
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.ticks += 1;
            stats.jobs_claimed += claimed as u64;
            stats.jobs_succeeded += succeeded;
            stats.jobs_retried += retried;
            stats.jobs_failed_permanently += failed;
        }
    }

    async fn sweep_stale_claims(&self, stale_after: Duration) {
        let cutoff = Utc::now() - ChronoDuration::from_std(stale_after).unwrap_or_default();
        match self.store.reap_stale(cutoff).await {
            Ok(0) => {}
            Ok(released) => {
                warn!(scheduler = %self.config.name, released, "released stale in-progress claims");
                if let Ok(mut stats) = self.stats.lock() {
                    stats.stale_reclaims += released;
                }
            }
            Err(e) => warn!(scheduler = %self.config.name, error = %e, "stale-claim sweep failed"),
        }
    }

    /// Spawn the scheduling loop.
    ///
    /// The first tick runs immediately, then every `tick_interval`. The
    /// returned handle's `shutdown()` stops the loop after any in-flight
    /// dispatch completes.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let scheduler = Arc::new(self);

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.tick_interval);
            // A timer fire that lands mid-dispatch is dropped, not queued.
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(scheduler = %scheduler.config.name, "scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => scheduler.run_tick().await,
                }
            }

            info!(scheduler = %scheduler.config.name, "scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Drive one claimed job to an outcome.
///
/// Store failures while recording the outcome are logged and swallowed;
/// the job will surface again through the stale-claim sweep rather than
/// take down the loop.
async fn process_job(
    store: Arc<dyn JobStore>,
    reconciler: AccessReconciler,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    budget: Duration,
    job: SyncJob,
) -> JobOutcome {
    let result = tokio::time::timeout(
        budget,
        reconciler.reconcile(job.user_id, job.desired_action),
    )
    .await;

    let reconcile_error = match result {
        Ok(Ok(())) => {
            info!(
                job_id = %job.id,
                subject_id = %job.subject_id,
                action = job.desired_action.as_str(),
                "reconciliation succeeded"
            );
            if let Err(e) = store.complete(job.id).await {
                error!(job_id = %job.id, error = %e, "failed to record completion");
            }
            return JobOutcome::Succeeded;
        }
        Ok(Err(e)) => e,
        Err(_) => ReconcileError::Timeout(budget),
    };

    let message = reconcile_error.to_string();
    classifier.classify_and_log(&message, &job).await;

    // This failure included.
    let failures = job.attempt_count + 1;
    match retry.next_attempt(failures) {
        Some(delay) => {
            let next_not_before =
                Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
            warn!(
                job_id = %job.id,
                subject_id = %job.subject_id,
                attempt = failures,
                retry_at = %next_not_before,
                error = %message,
                "reconciliation failed; retry scheduled"
            );
            if let Err(e) = store.fail_transiently(job.id, &message, next_not_before).await {
                error!(job_id = %job.id, error = %e, "failed to record transient failure");
            }
            JobOutcome::Retried
        }
        None => {
            error!(
                job_id = %job.id,
                subject_id = %job.subject_id,
                attempts = failures,
                error = %message,
                "retries exhausted; job failed permanently"
            );
            if let Err(e) = store.fail_permanently(job.id, &message).await {
                error!(job_id = %job.id, error = %e, "failed to record permanent failure");
            }
            JobOutcome::FailedPermanently
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_jobs::store::InMemoryJobStore;
    use std::sync::Arc;
    use streamgate_core::{SubjectId, UserId};
    use streamgate_sync::{
        DesiredAction, EntitlementError, EntitlementStore, ErrorClassifier, InMemoryEntitlementStore,
        InMemoryErrorLogStore, InMemoryNotifier, JobStatus,
    };

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        entitlements: Arc<InMemoryEntitlementStore>,
        notifier: Arc<InMemoryNotifier>,
        scheduler: SyncScheduler,
    }

    fn fixture(config: SchedulerConfig, retry: RetryPolicy) -> Fixture {
        let store = InMemoryJobStore::arc();
        let entitlements = InMemoryEntitlementStore::arc();
        let logs = Arc::new(InMemoryErrorLogStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let scheduler = SyncScheduler::new(
            store.clone(),
            AccessReconciler::new(entitlements.clone()),
            ErrorClassifier::new(logs, notifier.clone()),
            retry,
            config,
        );
        Fixture {
            store,
            entitlements,
            notifier,
            scheduler,
        }
    }

    #[tokio::test]
    async fn tick_completes_a_successful_job() {
        let f = fixture(SchedulerConfig::default(), RetryPolicy::default());
        let user = UserId::new();
        let id = f
            .store
            .enqueue(SubjectId::new(), user, DesiredAction::Grant)
            .await
            .unwrap();

        f.scheduler.run_tick().await;

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(f.entitlements.is_entitled(user).await.unwrap());

        let stats = f.scheduler.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failure_goes_back_to_pending_with_backoff() {
        let f = fixture(
            SchedulerConfig::default(),
            RetryPolicy::fixed(3, Duration::from_secs(300)),
        );
        let id = f
            .store
            .enqueue(SubjectId::new(), UserId::new(), DesiredAction::Grant)
            .await
            .unwrap();
        f.entitlements
            .inject_failure(EntitlementError::Unavailable("socket reset".to_string()));

        f.scheduler.run_tick().await;

        let job = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 1);
        assert!(job.not_before > Utc::now());
        assert_eq!(f.notifier.count(), 0);
        assert_eq!(f.scheduler.stats().jobs_retried, 1);
    }

    #[tokio::test]
    async fn slow_reconciliation_times_out_as_transient() {
        // An entitlement store that never answers inside the budget.
        struct Stalled;
        #[async_trait::async_trait]
        impl EntitlementStore for Stalled {
            async fn is_entitled(&self, _user_id: UserId) -> Result<bool, EntitlementError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(false)
            }
            async fn grant(&self, _user_id: UserId) -> Result<(), EntitlementError> {
                Ok(())
            }
            async fn revoke(&self, _user_id: UserId) -> Result<(), EntitlementError> {
                Ok(())
            }
        }

        let store = InMemoryJobStore::arc();
        let logs = Arc::new(InMemoryErrorLogStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let scheduler = SyncScheduler::new(
            store.clone(),
            AccessReconciler::new(Arc::new(Stalled)),
            ErrorClassifier::new(logs, notifier),
            RetryPolicy::fixed(3, Duration::from_secs(60)),
            SchedulerConfig::default().with_reconcile_timeout(Duration::from_millis(20)),
        );

        let id = store
            .enqueue(SubjectId::new(), UserId::new(), DesiredAction::Grant)
            .await
            .unwrap();

        scheduler.run_tick().await;

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 1);
        assert!(job.last_error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn batch_dispatch_is_isolated_per_job() {
        let f = fixture(
            SchedulerConfig::default(),
            RetryPolicy::fixed(3, Duration::from_secs(60)),
        );

        // First store call fails (one job's read), the rest succeed.
        f.entitlements
            .inject_failure(EntitlementError::Unavailable("socket reset".to_string()));
        for _ in 0..3 {
            f.store
                .enqueue(SubjectId::new(), UserId::new(), DesiredAction::Grant)
                .await
                .unwrap();
        }

        f.scheduler.run_tick().await;

        let stats = f.scheduler.stats();
        assert_eq!(stats.jobs_claimed, 3);
        assert_eq!(stats.jobs_succeeded + stats.jobs_retried, 3);
        assert_eq!(stats.jobs_retried, 1);
    }

    #[tokio::test]
    async fn spawned_loop_processes_and_shuts_down_gracefully() {
        let f = fixture(
            SchedulerConfig::default()
                .with_tick_interval(Duration::from_millis(10))
                .with_name("test-loop"),
            RetryPolicy::default(),
        );
        let user = UserId::new();
        let id = f
            .store
            .enqueue(SubjectId::new(), user, DesiredAction::Grant)
            .await
            .unwrap();

        let store = f.store.clone();
        let handle = f.scheduler.spawn();

        // Wait for the loop to pick the job up.
        let mut done = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get(id).await.unwrap().unwrap().status == JobStatus::Completed {
                done = true;
                break;
            }
        }
        assert!(done, "job was not processed by the spawned loop");

        let stats = handle.stats();
        assert!(stats.ticks >= 1);
        handle.shutdown().await;
    }
}
