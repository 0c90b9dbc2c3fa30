//! Append-only error log, read by operators.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use streamgate_core::UserId;

use crate::job::SyncJobId;

/// Unique error-log identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLogId(pub Uuid);

impl ErrorLogId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ErrorLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ErrorLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure severity decided by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Retried quietly per the retry policy
    Recoverable,
    /// Retried too, but escalated to operators on every occurrence
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Recoverable => "recoverable",
            Severity::Critical => "critical",
        }
    }
}

/// One failure record, linked to the job that produced it.
///
/// Records are append-only: the pipeline never mutates or deletes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    pub id: ErrorLogId,
    pub job_id: SyncJobId,
    pub user_id: UserId,
    pub message: String,
    pub severity: Severity,
    /// Free-form context (attempt number, subject, action, ...)
    pub context: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl ErrorLog {
    pub fn new(
        job_id: SyncJobId,
        user_id: UserId,
        message: impl Into<String>,
        severity: Severity,
        context: Option<JsonValue>,
    ) -> Self {
        Self {
            id: ErrorLogId::new(),
            job_id,
            user_id,
            message: message.into(),
            severity,
            context,
            created_at: Utc::now(),
        }
    }
}

/// Error-log store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorLogError {
    #[error("error log storage: {0}")]
    Storage(String),
}

/// Append-only persistence for error logs.
///
/// Deliberately has no update or delete surface.
#[async_trait::async_trait]
pub trait ErrorLogStore: Send + Sync {
    /// Persist a record.
    async fn append(&self, log: ErrorLog) -> Result<(), ErrorLogError>;

    /// All records for one job, oldest first.
    async fn list_for_job(&self, job_id: SyncJobId) -> Result<Vec<ErrorLog>, ErrorLogError>;

    /// Most recent records across all jobs, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<ErrorLog>, ErrorLogError>;
}

/// In-memory error-log store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryErrorLogStore {
    logs: RwLock<Vec<ErrorLog>>,
}

impl InMemoryErrorLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ErrorLogStore for InMemoryErrorLogStore {
    async fn append(&self, log: ErrorLog) -> Result<(), ErrorLogError> {
        self.logs
            .write()
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?
            .push(log);
        Ok(())
    }

    async fn list_for_job(&self, job_id: SyncJobId) -> Result<Vec<ErrorLog>, ErrorLogError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?;
        Ok(logs.iter().filter(|l| l.job_id == job_id).cloned().collect())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ErrorLog>, ErrorLogError> {
        let logs = self
            .logs
            .read()
            .map_err(|e| ErrorLogError::Storage(e.to_string()))?;
        let mut recent: Vec<_> = logs.iter().cloned().collect();
        recent.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        recent.truncate(limit);
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_list_by_job() {
        let store = InMemoryErrorLogStore::new();
        let job_id = SyncJobId::new();
        let other_job = SyncJobId::new();
        let user = UserId::new();

        store
            .append(ErrorLog::new(job_id, user, "first", Severity::Recoverable, None))
            .await
            .unwrap();
        store
            .append(ErrorLog::new(other_job, user, "other", Severity::Critical, None))
            .await
            .unwrap();
        store
            .append(ErrorLog::new(job_id, user, "second", Severity::Recoverable, None))
            .await
            .unwrap();

        let logs = store.list_for_job(job_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");
    }

    #[tokio::test]
    async fn list_recent_is_newest_first_and_bounded() {
        let store = InMemoryErrorLogStore::new();
        let user = UserId::new();
        for i in 0..5 {
            store
                .append(ErrorLog::new(
                    SyncJobId::new(),
                    user,
                    format!("failure {i}"),
                    Severity::Recoverable,
                    None,
                ))
                .await
                .unwrap();
        }

        let recent = store.list_recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].created_at >= recent[1].created_at);
        assert!(recent[1].created_at >= recent[2].created_at);
    }
}
