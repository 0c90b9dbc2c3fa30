//! Core sync-job types and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use streamgate_core::{SubjectId, UserId};

/// Unique sync-job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncJobId(pub Uuid);

impl SyncJobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired entitlement outcome, fixed at enqueue time from the billing
/// event that triggered the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredAction {
    /// Ensure the user's entitlement record reflects active access.
    Grant,
    /// Ensure the user's entitlement record reflects no access.
    Revoke,
}

impl DesiredAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredAction::Grant => "grant",
            DesiredAction::Revoke => "revoke",
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to become eligible and be claimed
    Pending,
    /// Claimed by exactly one worker
    InProgress,
    /// Reconciliation succeeded
    Completed,
    /// Retries exhausted; requires operator intervention
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A unit of reconciliation work.
///
/// Jobs are never deleted; `Completed` and `Failed` are terminal and
/// retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    /// Unique job ID
    pub id: SyncJobId,
    /// Billing-side subscription being reconciled
    pub subject_id: SubjectId,
    /// Application user who owns the subscription
    pub user_id: UserId,
    /// Outcome to converge on
    pub desired_action: DesiredAction,
    /// Current status
    pub status: JobStatus,
    /// Failed attempts so far (starts at 0)
    pub attempt_count: u32,
    /// Eligibility gate: the job may run only once `now >= not_before`
    pub not_before: DateTime<Utc>,
    /// Most recent failure message; cleared on success
    pub last_error: Option<String>,
    /// When the current claim was taken (only meaningful while
    /// `InProgress`; the stale-claim sweep keys off this)
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal status
    pub processed_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    /// Create a new pending job, eligible immediately.
    pub fn new(subject_id: SubjectId, user_id: UserId, desired_action: DesiredAction) -> Self {
        let now = Utc::now();
        Self {
            id: SyncJobId::new(),
            subject_id,
            user_id,
            desired_action,
            status: JobStatus::Pending,
            attempt_count: 0,
            not_before: now,
            last_error: None,
            claimed_at: None,
            created_at: now,
            processed_at: None,
        }
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && now >= self.not_before
    }

    /// Transition `Pending → InProgress` (claimed by a worker).
    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::InProgress;
        self.claimed_at = Some(now);
    }

    /// Release a claim whose worker never reported back (crash or hang):
    /// the job becomes `Pending` again without counting an attempt.
    pub fn mark_reclaimed(&mut self) {
        self.status = JobStatus::Pending;
        self.claimed_at = None;
    }

    /// Transition `InProgress → Completed`.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.last_error = None;
        self.processed_at = Some(now);
    }

    /// Transition `InProgress → Pending` after a recoverable failure:
    /// the attempt is counted and the job becomes eligible again at
    /// `next_not_before`.
    pub fn mark_retry_pending(&mut self, error: impl Into<String>, next_not_before: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.not_before = next_not_before;
    }

    /// Transition `InProgress → Failed` once retries are exhausted.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.processed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_job() -> SyncJob {
        SyncJob::new(SubjectId::new(), UserId::new(), DesiredAction::Grant)
    }

    #[test]
    fn new_job_is_pending_and_eligible() {
        let job = test_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.is_eligible(Utc::now()));
        assert!(job.last_error.is_none());
        assert!(job.processed_at.is_none());
    }

    #[test]
    fn success_path_clears_error_and_stamps_processed_at() {
        let mut job = test_job();
        job.mark_in_progress(Utc::now());
        job.last_error = Some("older failure".to_string());

        job.mark_completed(Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.status.is_terminal());
        assert!(job.last_error.is_none());
        assert!(job.processed_at.is_some());
    }

    #[test]
    fn retry_advances_not_before_and_counts_the_attempt() {
        let mut job = test_job();
        job.mark_in_progress(Utc::now());

        let next = Utc::now() + ChronoDuration::minutes(5);
        job.mark_retry_pending("network error", next);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.not_before, next);
        assert_eq!(job.last_error.as_deref(), Some("network error"));
        assert!(!job.is_eligible(Utc::now()));
        assert!(job.is_eligible(next));
    }

    #[test]
    fn permanent_failure_is_terminal() {
        let mut job = test_job();
        job.mark_in_progress(Utc::now());
        job.mark_failed("authentication failed", Utc::now());

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.status.is_terminal());
        assert_eq!(job.attempt_count, 1);
        assert!(job.processed_at.is_some());
    }

    #[test]
    fn in_progress_is_not_eligible() {
        let mut job = test_job();
        job.mark_in_progress(Utc::now());
        assert!(!job.is_eligible(Utc::now()));
    }
}
