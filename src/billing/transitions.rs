//! Entitlement state changes driven by billing events.

use crate::models::{Entitlement, EntitlementStatus};
use crate::payments::StripeSubscription;

/// New status, plus a new expiry when the event carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: EntitlementStatus,
    pub expiry: Option<i64>,
}

impl Transition {
    fn to(status: EntitlementStatus, expiry: Option<i64>) -> Self {
        Self { status, expiry }
    }
}

/// Why an event leaves an entitlement untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Deleted subscriptions stay revoked
    Revoked,
    /// A newer event was already applied
    Stale,
}

pub fn guard(entitlement: &Entitlement, event_at: i64) -> Result<(), Skip> {
    if entitlement.status == EntitlementStatus::Revoked {
        return Err(Skip::Revoked);
    }
    match entitlement.billing_event_at {
        Some(applied) if applied > event_at => Err(Skip::Stale),
        _ => Ok(()),
    }
}

/// Status/expiry for a newly seen subscription. None means nothing to grant.
pub fn for_new_subscription(sub: &StripeSubscription) -> Option<Transition> {
    match sub.status.as_str() {
        "canceled" | "incomplete_expired" => None,
        "trialing" => Some(Transition::to(
            EntitlementStatus::Trial,
            sub.trial_end.or(sub.period_end()),
        )),
        "past_due" | "incomplete" => Some(Transition::to(
            EntitlementStatus::AwaitingPayment,
            sub.period_end(),
        )),
        "unpaid" | "paused" => Some(Transition::to(EntitlementStatus::Suspended, sub.period_end())),
        _ => Some(Transition::to(EntitlementStatus::Active, sub.period_end())),
    }
}

/// Status/expiry for a subscription update, given the entitlement's current status.
pub fn for_subscription_update(
    sub: &StripeSubscription,
    current: EntitlementStatus,
) -> Option<Transition> {
    use EntitlementStatus::*;

    match sub.status.as_str() {
        "canceled" | "incomplete_expired" => Some(Transition::to(Revoked, None)),
        "active" | "trialing" if sub.cancel_scheduled() => Some(Transition::to(
            PendingCancellation,
            sub.cancel_at.or(sub.period_end()),
        )),
        "past_due" => Some(Transition::to(AwaitingPayment, None)),
        "unpaid" | "paused" => Some(Transition::to(Suspended, None)),
        "trialing" => Some(Transition::to(Trial, sub.trial_end.or(sub.period_end()))),
        // Suspension is lifted by a paid invoice, not by the subscription flipping back
        "active" => match current {
            PendingCancellation | AwaitingPayment | Trial | Active => {
                Some(Transition::to(Active, sub.period_end()))
            }
            Suspended | Revoked => None,
        },
        _ => None,
    }
}

pub fn for_invoice_paid(period_end: Option<i64>) -> Transition {
    Transition::to(EntitlementStatus::Active, period_end)
}

pub fn for_payment_failed() -> Transition {
    Transition::to(EntitlementStatus::Suspended, None)
}

pub fn for_subscription_deleted() -> Transition {
    Transition::to(EntitlementStatus::Revoked, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Origin;
    use crate::payments::StripeList;

    fn subscription(status: &str) -> StripeSubscription {
        StripeSubscription {
            id: "sub_1".into(),
            customer: "cus_1".into(),
            status: status.into(),
            current_period_end: Some(2_000),
            trial_end: Some(1_500),
            cancel_at_period_end: false,
            cancel_at: None,
            items: StripeList::default(),
        }
    }

    fn entitlement(status: EntitlementStatus, billing_event_at: Option<i64>) -> Entitlement {
        Entitlement {
            id: "e".into(),
            license_id: "l".into(),
            product_sku: "grid-axis".into(),
            status,
            origin: Origin::Stripe,
            expires_at: Some(1_000),
            trial_expires_at: None,
            platform_subscription_id: Some("sub_1".into()),
            billing_event_at,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn scheduled_cancellation_becomes_pending() {
        let mut sub = subscription("active");
        sub.cancel_at_period_end = true;
        let t = for_subscription_update(&sub, EntitlementStatus::Active).unwrap();
        assert_eq!(t.status, EntitlementStatus::PendingCancellation);
        assert_eq!(t.expiry, Some(2_000));

        sub.cancel_at = Some(1_800);
        let t = for_subscription_update(&sub, EntitlementStatus::Active).unwrap();
        assert_eq!(t.expiry, Some(1_800));
    }

    #[test]
    fn cleared_cancellation_reactivates() {
        let sub = subscription("active");
        for current in [
            EntitlementStatus::PendingCancellation,
            EntitlementStatus::AwaitingPayment,
        ] {
            let t = for_subscription_update(&sub, current).unwrap();
            assert_eq!(t, Transition::to(EntitlementStatus::Active, Some(2_000)));
        }
        assert_eq!(for_subscription_update(&sub, EntitlementStatus::Suspended), None);
    }

    #[test]
    fn provider_statuses_map_to_entitlement_statuses() {
        let cases = [
            ("past_due", Some(EntitlementStatus::AwaitingPayment)),
            ("unpaid", Some(EntitlementStatus::Suspended)),
            ("paused", Some(EntitlementStatus::Suspended)),
            ("trialing", Some(EntitlementStatus::Trial)),
            ("canceled", Some(EntitlementStatus::Revoked)),
            ("incomplete", None),
        ];
        for (status, expected) in cases {
            let t = for_subscription_update(&subscription(status), EntitlementStatus::Active);
            assert_eq!(t.map(|t| t.status), expected, "status {}", status);
        }
    }

    #[test]
    fn new_trialing_subscription_expires_at_trial_end() {
        let t = for_new_subscription(&subscription("trialing")).unwrap();
        assert_eq!(t, Transition::to(EntitlementStatus::Trial, Some(1_500)));
        assert!(for_new_subscription(&subscription("canceled")).is_none());
    }

    #[test]
    fn guard_rejects_revoked_and_stale() {
        assert_eq!(
            guard(&entitlement(EntitlementStatus::Revoked, None), 10),
            Err(Skip::Revoked)
        );
        assert_eq!(
            guard(&entitlement(EntitlementStatus::Active, Some(20)), 10),
            Err(Skip::Stale)
        );
        assert_eq!(guard(&entitlement(EntitlementStatus::Active, Some(10)), 10), Ok(()));
        assert_eq!(guard(&entitlement(EntitlementStatus::Suspended, None), 10), Ok(()));
    }
}
