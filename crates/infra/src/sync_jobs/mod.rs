//! Sync-job persistence and execution.
//!
//! ## Design
//!
//! - The job store is the single source of truth for job ownership;
//!   workers coordinate only through it (they may live in different
//!   processes)
//! - Claiming is atomic per job and admits at most one `InProgress` job
//!   per subject at any instant
//! - The scheduler runs a single-flight tick loop: a tick that fires while
//!   dispatch is still in flight is skipped entirely, never queued
//! - Jobs are never deleted; terminal jobs stay queryable for audit
//!
//! ## Components
//!
//! - `JobStore`: persistence contract, with in-memory and Postgres
//!   implementations
//! - `SyncScheduler`: claims eligible batches and fans them out to
//!   bounded-concurrency workers
//! - `enqueue_sync`: the inbound boundary billing-event ingestion (and
//!   operator manual resync) calls into

pub mod postgres;
pub mod scheduler;
pub mod store;

pub use postgres::{PostgresEntitlementStore, PostgresErrorLogStore, PostgresJobStore, ensure_schema};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SchedulerStats, SyncScheduler};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};

use streamgate_core::{SubjectId, UserId};
use streamgate_sync::{BillingEventKind, DesiredAction, SubscriptionStatus, SyncJobId};

/// Inbound event boundary.
///
/// Called by billing-event ingestion whenever a subscription-lifecycle
/// notification arrives, and by the operator-triggered manual resync path
/// for jobs that exhausted their retries. The desired action is fixed
/// here, at enqueue time.
pub async fn enqueue_sync(
    store: &dyn JobStore,
    subject_id: SubjectId,
    user_id: UserId,
    kind: BillingEventKind,
    status: SubscriptionStatus,
) -> Result<SyncJobId, JobStoreError> {
    let action = DesiredAction::from_billing(kind, status);
    store.enqueue(subject_id, user_id, action).await
}
