//! Failure classification, error-log persistence, operator escalation.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, warn};

use crate::error_log::{ErrorLog, ErrorLogStore, Severity};
use crate::job::SyncJob;
use crate::notify::{NotificationKind, Notifier};

/// Failure messages matching any of these (case-insensitive substring)
/// are escalated to operators in addition to the normal retry path.
const CRITICAL_PATTERNS: &[&str] = &[
    "connection refused",
    "authentication failed",
    "permission denied",
    "rate limit exceeded",
];

/// Inspects a failure, decides severity, persists an error record, and
/// escalates critical failures.
///
/// Instantiate once per process and hand it to the scheduler by reference;
/// there is no global singleton.
#[derive(Clone)]
pub struct ErrorClassifier {
    patterns: Vec<String>,
    logs: Arc<dyn ErrorLogStore>,
    notifier: Arc<dyn Notifier>,
}

impl ErrorClassifier {
    /// Classifier with the default critical-pattern set.
    pub fn new(logs: Arc<dyn ErrorLogStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            patterns: CRITICAL_PATTERNS.iter().map(|p| p.to_string()).collect(),
            logs,
            notifier,
        }
    }

    /// Classifier with a custom pattern set.
    pub fn with_patterns(
        patterns: Vec<String>,
        logs: Arc<dyn ErrorLogStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
            logs,
            notifier,
        }
    }

    /// Decide severity from the failure message alone.
    pub fn classify(&self, message: &str) -> Severity {
        let lowered = message.to_lowercase();
        if self.patterns.iter().any(|p| lowered.contains(p)) {
            Severity::Critical
        } else {
            Severity::Recoverable
        }
    }

    /// Persist an error record for a failed attempt and escalate if the
    /// failure is critical.
    ///
    /// Neither a log-store write failure nor a notifier failure aborts
    /// this path: both are demoted to the process diagnostic sink, and
    /// the built record is returned regardless so the caller can finish
    /// the job's status transition.
    pub async fn classify_and_log(&self, message: &str, job: &SyncJob) -> ErrorLog {
        let severity = self.classify(message);
        let context = json!({
            "subject_id": job.subject_id,
            "desired_action": job.desired_action.as_str(),
            "attempt": job.attempt_count + 1,
        });
        let log = ErrorLog::new(job.id, job.user_id, message, severity, Some(context.clone()));

        if let Err(e) = self.logs.append(log.clone()).await {
            error!(job_id = %job.id, error = %e, "failed to persist error log");
        }

        if severity == Severity::Critical {
            if let Err(e) = self
                .notifier
                .notify(NotificationKind::SyncFailure, job.user_id, message, Some(&context))
                .await
            {
                warn!(job_id = %job.id, error = %e, "critical-failure notification did not go out");
            }
        }

        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_log::InMemoryErrorLogStore;
    use crate::job::DesiredAction;
    use crate::notify::InMemoryNotifier;
    use streamgate_core::{SubjectId, UserId};

    fn setup() -> (ErrorClassifier, Arc<InMemoryErrorLogStore>, Arc<InMemoryNotifier>) {
        let logs = Arc::new(InMemoryErrorLogStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let classifier = ErrorClassifier::new(logs.clone(), notifier.clone());
        (classifier, logs, notifier)
    }

    fn test_job() -> SyncJob {
        SyncJob::new(SubjectId::new(), UserId::new(), DesiredAction::Grant)
    }

    #[test]
    fn critical_patterns_match_case_insensitively() {
        let (classifier, _, _) = setup();

        assert_eq!(classifier.classify("Connection Refused by host"), Severity::Critical);
        assert_eq!(classifier.classify("authentication failed for key"), Severity::Critical);
        assert_eq!(classifier.classify("permission denied on grant"), Severity::Critical);
        assert_eq!(classifier.classify("Rate Limit Exceeded, slow down"), Severity::Critical);
        assert_eq!(classifier.classify("temporary network blip"), Severity::Recoverable);
        assert_eq!(classifier.classify("reconciliation timed out after 30s"), Severity::Recoverable);
    }

    #[tokio::test]
    async fn always_persists_a_record() {
        let (classifier, logs, _) = setup();
        let job = test_job();

        let log = classifier.classify_and_log("temporary network blip", &job).await;
        assert_eq!(log.severity, Severity::Recoverable);

        let stored = logs.list_for_job(job.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "temporary network blip");
    }

    #[tokio::test]
    async fn critical_failure_notifies_once_per_attempt() {
        let (classifier, _, notifier) = setup();
        let job = test_job();

        classifier.classify_and_log("authentication failed", &job).await;
        assert_eq!(notifier.count(), 1);

        classifier.classify_and_log("authentication failed", &job).await;
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn recoverable_failure_does_not_notify() {
        let (classifier, _, notifier) = setup();
        let job = test_job();

        classifier.classify_and_log("socket reset mid-flight", &job).await;
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn custom_patterns_override_defaults() {
        let logs = Arc::new(InMemoryErrorLogStore::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let classifier = ErrorClassifier::with_patterns(
            vec!["Quota Blown".to_string()],
            logs,
            notifier,
        );

        assert_eq!(classifier.classify("quota blown for tenant"), Severity::Critical);
        assert_eq!(classifier.classify("authentication failed"), Severity::Recoverable);
    }
}
