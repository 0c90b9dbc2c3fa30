//! Operator notification seam.
//!
//! The actual delivery channel (pager, chat, email) is an external
//! collaborator; the pipeline only needs a way to hand it a critical
//! failure.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use streamgate_core::UserId;

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A reconciliation attempt failed with a critical error.
    SyncFailure,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SyncFailure => "sync_failure",
        }
    }
}

/// Notification delivery error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Human-visible escalation channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        kind: NotificationKind,
        user_id: UserId,
        message: &str,
        context: Option<&JsonValue>,
    ) -> Result<(), NotifyError>;
}

/// A notification captured by [`InMemoryNotifier`].
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub user_id: UserId,
    pub message: String,
    pub context: Option<JsonValue>,
}

/// In-memory notifier for tests/dev: records every call.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything notified so far, in call order.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        user_id: UserId,
        message: &str,
        context: Option<&JsonValue>,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?
            .push(SentNotification {
                kind,
                user_id,
                message: message.to_string(),
                context: context.cloned(),
            });
        Ok(())
    }
}
