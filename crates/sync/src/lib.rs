//! Subscription-access synchronization domain.
//!
//! The background pipeline that keeps the application's content-access
//! grants in step with the external billing system's view of each
//! subscription.
//!
//! ## Design
//!
//! - A `SyncJob` is the unit of reconciliation work, carried through
//!   `Pending → InProgress → Completed` (or back to `Pending` with backoff,
//!   or terminally `Failed` once retries are exhausted)
//! - Reconciliation is idempotent: re-applying a desired action is a no-op
//! - Failures are classified against a fixed critical-pattern set; critical
//!   ones escalate to operators through the notifier seam
//! - One retry policy, consulted in exactly one place
//!
//! ## Components
//!
//! - `SyncJob`: job state and lifecycle transitions
//! - `RetryPolicy`: schedule-based backoff with a hard attempt ceiling
//! - `ErrorClassifier`: severity classification, error-log persistence,
//!   critical escalation
//! - `AccessReconciler`: maps a desired action onto the entitlement store
//! - Seam traits consumed by the pipeline: `EntitlementStore`,
//!   `ErrorLogStore`, `Notifier`

pub mod billing;
pub mod classify;
pub mod error_log;
pub mod job;
pub mod notify;
pub mod reconcile;
pub mod retry;

pub use billing::{BillingEventKind, SubscriptionStatus};
pub use classify::ErrorClassifier;
pub use error_log::{ErrorLog, ErrorLogError, ErrorLogId, ErrorLogStore, InMemoryErrorLogStore, Severity};
pub use job::{DesiredAction, JobStatus, SyncJob, SyncJobId};
pub use notify::{InMemoryNotifier, NotificationKind, Notifier, NotifyError, SentNotification};
pub use reconcile::{
    AccessReconciler, EntitlementError, EntitlementStore, InMemoryEntitlementStore, ReconcileError,
};
pub use retry::RetryPolicy;
