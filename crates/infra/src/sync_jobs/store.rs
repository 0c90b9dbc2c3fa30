//! Job storage: contract and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use streamgate_core::{SubjectId, UserId};
use streamgate_sync::{DesiredAction, JobStatus, SyncJob, SyncJobId};

/// Durable persistence for sync jobs.
///
/// The store is the single source of truth for "who owns this job right
/// now". Claiming must be atomic per job so that concurrent schedulers
/// can never double-claim, and at most one `InProgress` job may exist per
/// subject at any instant.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new `Pending` job with `attempt_count = 0`, eligible
    /// immediately.
    async fn enqueue(
        &self,
        subject_id: SubjectId,
        user_id: UserId,
        desired_action: DesiredAction,
    ) -> Result<SyncJobId, JobStoreError>;

    /// Fetch a job by id.
    async fn get(&self, id: SyncJobId) -> Result<Option<SyncJob>, JobStoreError>;

    /// Atomically claim up to `limit` eligible jobs (`Pending`,
    /// `not_before <= now`), oldest `created_at` first, transitioning each
    /// to `InProgress`.
    ///
    /// Subjects that already have an `InProgress` job are excluded, and at
    /// most one job per subject is taken within a batch.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError>;

    /// `InProgress → Completed`: clears `last_error`, stamps `processed_at`.
    async fn complete(&self, id: SyncJobId) -> Result<(), JobStoreError>;

    /// `InProgress → Pending`: counts the attempt, records the error, and
    /// gates the job until `next_not_before`.
    async fn fail_transiently(
        &self,
        id: SyncJobId,
        error: &str,
        next_not_before: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// `InProgress → Failed`: counts the attempt, records the error,
    /// stamps `processed_at`. Terminal; only a manual resync creates a
    /// fresh job for the subject afterwards.
    async fn fail_permanently(&self, id: SyncJobId, error: &str) -> Result<(), JobStoreError>;

    /// Jobs for operator dashboards, newest first. `None` lists every
    /// status.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<SyncJob>, JobStoreError>;

    /// Counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Release `InProgress` claims taken before `older_than` back to
    /// `Pending` without counting an attempt (the worker crashed or hung
    /// and never reported). Returns how many jobs were released.
    async fn reap_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(SyncJobId),
    #[error("invalid status transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: SyncJobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<SyncJobId, SyncJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    /// Insert a caller-built job as-is. Lets tests and tooling control
    /// `created_at`/`not_before` precisely; production enqueueing goes
    /// through [`JobStore::enqueue`].
    pub fn insert(&self, job: SyncJob) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(job.id, job);
        }
    }

    fn transition<F>(
        &self,
        id: SyncJobId,
        to: JobStatus,
        apply: F,
    ) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut SyncJob),
    {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::InProgress {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        apply(job);
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        subject_id: SubjectId,
        user_id: UserId,
        desired_action: DesiredAction,
    ) -> Result<SyncJobId, JobStoreError> {
        let job = SyncJob::new(subject_id, user_id, desired_action);
        let id = job.id;
        self.jobs
            .write()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?
            .insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: SyncJobId) -> Result<Option<SyncJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(jobs.get(&id).cloned())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<SyncJob>, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let now = Utc::now();

        // Subjects already being reconciled are off limits; the set also
        // dedupes subjects within this batch.
        let mut busy_subjects: HashSet<SubjectId> = jobs
            .values()
            .filter(|j| j.status == JobStatus::InProgress)
            .map(|j| j.subject_id)
            .collect();

        let mut eligible: Vec<(DateTime<Utc>, SyncJobId, SubjectId)> = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .map(|j| (j.created_at, j.id, j.subject_id))
            .collect();
        // Oldest first; the time-ordered id breaks created_at ties.
        eligible.sort_by_key(|(created_at, id, _)| (*created_at, id.0));

        let mut claimed = Vec::new();
        for (_, id, subject_id) in eligible {
            if claimed.len() >= limit {
                break;
            }
            if !busy_subjects.insert(subject_id) {
                continue;
            }
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_in_progress(now);
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, id: SyncJobId) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Completed, |job| {
            job.mark_completed(Utc::now());
        })
    }

    async fn fail_transiently(
        &self,
        id: SyncJobId,
        error: &str,
        next_not_before: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Pending, |job| {
            job.mark_retry_pending(error, next_not_before);
        })
    }

    async fn fail_permanently(&self, id: SyncJobId, error: &str) -> Result<(), JobStoreError> {
        self.transition(id, JobStatus::Failed, |job| {
            job.mark_failed(error, Utc::now());
        })
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<SyncJob>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        result.sort_by_key(|j| std::cmp::Reverse((j.created_at, j.id.0)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InProgress => stats.in_progress += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn reap_stale(&self, older_than: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        let mut released = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::InProgress
                && job.claimed_at.is_some_and(|at| at < older_than)
            {
                job.mark_reclaimed();
                released += 1;
            }
        }
        Ok(released)
    }
}
