//! Billing-event ingestion boundary.
//!
//! The webhook glue that receives subscription-lifecycle notifications is
//! outside this core and treated as a trusted event source; it calls in
//! here to derive the desired action for a sync job. The same path serves
//! operator-triggered manual resyncs.

use serde::{Deserialize, Serialize};

use crate::job::DesiredAction;

/// Subscription-lifecycle notification kinds the billing system emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventKind {
    SubscriptionCreated,
    SubscriptionRenewed,
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCanceled,
    SubscriptionExpired,
}

/// Subscription status as reported in the event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
}

impl DesiredAction {
    /// Derive the desired entitlement outcome from a billing event.
    ///
    /// Terminal event kinds revoke unconditionally; otherwise the payload
    /// status decides (a renewal webhook whose payload already shows
    /// `past_due` revokes).
    pub fn from_billing(kind: BillingEventKind, status: SubscriptionStatus) -> Self {
        match kind {
            BillingEventKind::SubscriptionCanceled | BillingEventKind::SubscriptionExpired => {
                DesiredAction::Revoke
            }
            _ => match status {
                SubscriptionStatus::Active | SubscriptionStatus::Trialing => DesiredAction::Grant,
                SubscriptionStatus::PastDue
                | SubscriptionStatus::Canceled
                | SubscriptionStatus::Unpaid => DesiredAction::Revoke,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses_grant() {
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::SubscriptionCreated, SubscriptionStatus::Active),
            DesiredAction::Grant
        );
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::PaymentSucceeded, SubscriptionStatus::Trialing),
            DesiredAction::Grant
        );
    }

    #[test]
    fn delinquent_statuses_revoke() {
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::PaymentFailed, SubscriptionStatus::PastDue),
            DesiredAction::Revoke
        );
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::SubscriptionRenewed, SubscriptionStatus::Unpaid),
            DesiredAction::Revoke
        );
    }

    #[test]
    fn terminal_kinds_revoke_regardless_of_status() {
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::SubscriptionCanceled, SubscriptionStatus::Active),
            DesiredAction::Revoke
        );
        assert_eq!(
            DesiredAction::from_billing(BillingEventKind::SubscriptionExpired, SubscriptionStatus::Trialing),
            DesiredAction::Revoke
        );
    }
}
