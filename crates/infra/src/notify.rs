//! Notification adapters.

use serde_json::Value as JsonValue;
use tracing::error;

use streamgate_core::UserId;
use streamgate_sync::{NotificationKind, Notifier, NotifyError};

/// Notifier that emits a structured `error!` event per escalation.
///
/// The external alerting collaborator consumes these from the process log
/// stream; deployments with a direct paging integration swap in their own
/// [`Notifier`] implementation at wiring time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        user_id: UserId,
        message: &str,
        context: Option<&JsonValue>,
    ) -> Result<(), NotifyError> {
        error!(
            alert = true,
            kind = kind.as_str(),
            user_id = %user_id,
            context = context.map(|c| c.to_string()).unwrap_or_default(),
            "{message}"
        );
        Ok(())
    }
}
