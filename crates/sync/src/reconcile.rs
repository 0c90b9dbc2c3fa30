//! Access reconciliation against the entitlement store.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use streamgate_core::UserId;

use crate::job::DesiredAction;

/// Entitlement collaborator error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EntitlementError {
    /// The store could not be reached or answered too slowly.
    #[error("entitlement store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the operation (auth, permissions, quota).
    #[error("entitlement operation rejected: {0}")]
    Rejected(String),
}

/// Application-side record of whether a user may access premium content.
///
/// The store is an external access-control collaborator; both mutations
/// are idempotent on its side.
#[async_trait::async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn is_entitled(&self, user_id: UserId) -> Result<bool, EntitlementError>;
    async fn grant(&self, user_id: UserId) -> Result<(), EntitlementError>;
    async fn revoke(&self, user_id: UserId) -> Result<(), EntitlementError>;
}

/// Reconciliation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("entitlement store: {0}")]
    Entitlement(#[from] EntitlementError),
    /// Produced by the worker when the per-call budget elapses.
    #[error("reconciliation timed out after {0:?}")]
    Timeout(Duration),
}

/// Pure mapping from (user, desired billing state) to an entitlement
/// side effect.
///
/// Idempotent by construction: the current state is read first and a
/// write happens only when it differs from the desired one. If the read
/// fails, nothing is written (fail closed — no partial state).
#[derive(Clone)]
pub struct AccessReconciler {
    entitlements: Arc<dyn EntitlementStore>,
}

impl AccessReconciler {
    pub fn new(entitlements: Arc<dyn EntitlementStore>) -> Self {
        Self { entitlements }
    }

    /// Converge the user's entitlement onto `desired_action`.
    ///
    /// Applying the same action twice yields the same end state, and the
    /// second application is a successful no-op.
    pub async fn reconcile(
        &self,
        user_id: UserId,
        desired_action: DesiredAction,
    ) -> Result<(), ReconcileError> {
        let entitled = self.entitlements.is_entitled(user_id).await?;

        match (desired_action, entitled) {
            (DesiredAction::Grant, true) | (DesiredAction::Revoke, false) => Ok(()),
            (DesiredAction::Grant, false) => {
                self.entitlements.grant(user_id).await?;
                Ok(())
            }
            (DesiredAction::Revoke, true) => {
                self.entitlements.revoke(user_id).await?;
                Ok(())
            }
        }
    }
}

/// In-memory entitlement store for tests/dev.
///
/// Failures can be scripted with [`inject_failure`](Self::inject_failure):
/// each injected error is consumed by the next store call, in order, after
/// which calls succeed again.
#[derive(Debug, Default)]
pub struct InMemoryEntitlementStore {
    entitled: RwLock<HashSet<UserId>>,
    scripted_failures: RwLock<VecDeque<EntitlementError>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Queue an error to be returned by the next store call.
    pub fn inject_failure(&self, error: EntitlementError) {
        if let Ok(mut q) = self.scripted_failures.write() {
            q.push_back(error);
        }
    }

    fn take_scripted_failure(&self) -> Option<EntitlementError> {
        self.scripted_failures.write().ok()?.pop_front()
    }
}

#[async_trait::async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn is_entitled(&self, user_id: UserId) -> Result<bool, EntitlementError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        Ok(self
            .entitled
            .read()
            .map_err(|e| EntitlementError::Unavailable(e.to_string()))?
            .contains(&user_id))
    }

    async fn grant(&self, user_id: UserId) -> Result<(), EntitlementError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        self.entitled
            .write()
            .map_err(|e| EntitlementError::Unavailable(e.to_string()))?
            .insert(user_id);
        Ok(())
    }

    async fn revoke(&self, user_id: UserId) -> Result<(), EntitlementError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        self.entitled
            .write()
            .map_err(|e| EntitlementError::Unavailable(e.to_string()))?
            .remove(&user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (AccessReconciler, Arc<InMemoryEntitlementStore>) {
        let store = InMemoryEntitlementStore::arc();
        (AccessReconciler::new(store.clone()), store)
    }

    #[tokio::test]
    async fn grant_is_idempotent() {
        let (reconciler, store) = setup();
        let user = UserId::new();

        reconciler.reconcile(user, DesiredAction::Grant).await.unwrap();
        assert!(store.is_entitled(user).await.unwrap());

        // Second application is a successful no-op.
        reconciler.reconcile(user, DesiredAction::Grant).await.unwrap();
        assert!(store.is_entitled(user).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let (reconciler, store) = setup();
        let user = UserId::new();

        store.grant(user).await.unwrap();
        reconciler.reconcile(user, DesiredAction::Revoke).await.unwrap();
        assert!(!store.is_entitled(user).await.unwrap());

        reconciler.reconcile(user, DesiredAction::Revoke).await.unwrap();
        assert!(!store.is_entitled(user).await.unwrap());
    }

    #[tokio::test]
    async fn read_failure_prevents_any_write() {
        let (reconciler, store) = setup();
        let user = UserId::new();

        store.inject_failure(EntitlementError::Unavailable("connection refused".to_string()));
        let err = reconciler.reconcile(user, DesiredAction::Grant).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Entitlement(_)));

        // Fail closed: the failed read must not have produced a grant.
        assert!(!store.is_entitled(user).await.unwrap());
    }

    #[tokio::test]
    async fn failed_revoke_leaves_entitlement_untouched() {
        let (reconciler, store) = setup();
        let user = UserId::new();

        store.grant(user).await.unwrap();
        store.inject_failure(EntitlementError::Rejected("permission denied".to_string()));

        let err = reconciler.reconcile(user, DesiredAction::Revoke).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Entitlement(_)));
        assert!(store.is_entitled(user).await.unwrap());
    }
}
