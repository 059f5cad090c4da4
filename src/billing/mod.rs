//! Folds the billing provider's webhook stream into entitlement and ledger
//! state.
//!
//! Deliveries may be duplicated, replayed or reordered. Every mutating event
//! records its id inside the transaction that applies it, entitlements are
//! found by subscription id, and each entitlement remembers the creation
//! time of the last event applied to it so older snapshots are ignored.

pub mod events;
pub mod transitions;

use axum::http::StatusCode;
use rusqlite::{Connection, TransactionBehavior};
use tokio::time::Instant;

use crate::catalog;
use crate::db::{AppState, queries, retry_transient};
use crate::error::{AppError, Result};
use crate::ledger::{self, LedgerEntry};
use crate::models::{BillingCustomer, Entitlement, EntitlementStatus, LicenseContact, Origin};
use crate::notify::{self, Notification, SYSTEM_ALERT_FAMILY};
use crate::payments::{
    StripeCreditNote, StripeCustomer, StripeInvoice, StripeSubscription, verify_webhook_signature,
};
use crate::provisioning::{self, ProvisionRequest};
use crate::util::now;

pub use events::{BillingEvent, DecodedEvent};
use transitions::{Skip, Transition};

/// Result of a handled event: response body plus notifications owed after commit.
struct Handled {
    body: &'static str,
    notifications: Vec<Notification>,
}

impl Handled {
    fn quiet(body: &'static str) -> Self {
        Self {
            body,
            notifications: Vec::new(),
        }
    }
}

/// Verify, decode and apply one webhook delivery.
pub async fn process_billing_event(
    state: &AppState,
    raw: &[u8],
    signature: Option<&str>,
) -> (StatusCode, &'static str) {
    match &state.config.stripe_webhook_secret {
        Some(secret) => {
            let Some(signature) = signature else {
                tracing::warn!("billing webhook without signature header");
                return (StatusCode::FORBIDDEN, "Missing signature");
            };
            match verify_webhook_signature(
                secret,
                raw,
                signature,
                state.config.signature_tolerance_secs,
                now(),
            ) {
                Ok(true) => {}
                Ok(false) => return (StatusCode::FORBIDDEN, "Invalid signature"),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed billing webhook signature");
                    return (StatusCode::FORBIDDEN, "Invalid signature");
                }
            }
        }
        None if state.config.dev_mode => {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, accepting unsigned webhook (dev mode)");
        }
        None => {
            tracing::error!("STRIPE_WEBHOOK_SECRET not set, refusing billing webhook");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Webhook secret not configured");
        }
    }

    let event = match events::decode(raw) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, "failed to decode billing webhook");
            return (StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    if matches!(event.kind, BillingEvent::Unknown) {
        tracing::debug!(event_type = %event.event_type, "ignoring unhandled billing event");
        return (StatusCode::OK, "Event ignored");
    }

    tracing::info!(event_id = %event.id, event_type = %event.event_type, "processing billing event");

    // Handling and the notifications it owes share one deadline
    let deadline = Instant::now() + state.config.webhook_timeout;
    let outcome = tokio::time::timeout_at(deadline, handle(state, &event)).await;

    match outcome {
        Err(_) => {
            tracing::error!(event_id = %event.id, "billing event processing timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "Processing timed out")
        }
        Ok(Ok(handled)) => {
            dispatch_until(state, &event, deadline, handled.notifications).await;
            (StatusCode::OK, handled.body)
        }
        Ok(Err(AppError::UpstreamInconsistency(msg))) => {
            tracing::warn!(event_id = %event.id, event_type = %event.event_type, %msg, "billing event acknowledged without effect");
            let alert = Notification::admin_alert(
                SYSTEM_ALERT_FAMILY,
                format!("Billing event {} needs attention", event.event_type),
                format!("Event {}: {}", event.id, msg),
            );
            dispatch_until(state, &event, deadline, vec![alert]).await;
            (StatusCode::OK, "Acknowledged")
        }
        Ok(Err(AppError::BadRequest(msg))) => {
            tracing::error!(event_id = %event.id, %msg, "billing event rejected");
            (StatusCode::BAD_REQUEST, "Invalid payload")
        }
        Ok(Err(e)) => {
            tracing::error!(event_id = %event.id, error = %e, "billing event processing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed")
        }
    }
}

/// Send post-commit notifications, abandoning whatever is left at the deadline.
async fn dispatch_until(
    state: &AppState,
    event: &DecodedEvent,
    deadline: Instant,
    notifications: Vec<Notification>,
) {
    if notifications.is_empty() {
        return;
    }
    let queued = notifications.len();
    if tokio::time::timeout_at(deadline, notify::dispatch(state.notifier.as_ref(), notifications))
        .await
        .is_err()
    {
        tracing::warn!(event_id = %event.id, queued, "notification dispatch cut off by webhook deadline");
    }
}

async fn handle(state: &AppState, event: &DecodedEvent) -> Result<Handled> {
    {
        let conn = state.db.get()?;
        if queries::billing_event_processed(&conn, &event.id)? {
            return Ok(Handled::quiet("Already processed"));
        }
    }

    match &event.kind {
        BillingEvent::CustomerUpserted(customer) => customer_upserted(state, event, customer).await,
        BillingEvent::SubscriptionCreated(sub) => subscription_created(state, event, sub).await,
        BillingEvent::SubscriptionUpdated(sub) => subscription_updated(state, event, sub).await,
        BillingEvent::SubscriptionDeleted(sub) => {
            let transition = transitions::for_subscription_deleted();
            apply_to_subscription(state, event, &sub.id, |_| Some(transition)).await
        }
        BillingEvent::InvoicePaid(invoice) => invoice_paid(state, event, invoice).await,
        BillingEvent::InvoicePaymentFailed(invoice) => {
            let Some(subscription_id) = invoice.subscription_id() else {
                return Ok(Handled::quiet("No subscription"));
            };
            let transition = transitions::for_payment_failed();
            apply_to_subscription(state, event, subscription_id, |_| Some(transition)).await
        }
        BillingEvent::CreditNoteCreated(note) => credit_note_created(state, event, note).await,
        BillingEvent::Unknown => Ok(Handled::quiet("Event ignored")),
    }
}

/// Run `apply` in one IMMEDIATE transaction that also records the event id.
/// Returns None when the event had already been recorded.
async fn in_event_tx<T, F>(state: &AppState, event: &DecodedEvent, mut apply: F) -> Result<Option<T>>
where
    F: FnMut(&Connection) -> Result<T>,
{
    retry_transient(state.config.db_retry_attempts, || {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !queries::try_record_billing_event(&tx, &event.id, &event.event_type)? {
            return Ok(None);
        }
        let value = apply(&tx)?;
        tx.commit()?;
        Ok(Some(value))
    })
    .await
}

async fn customer_upserted(
    state: &AppState,
    event: &DecodedEvent,
    customer: &StripeCustomer,
) -> Result<Handled> {
    let cached: BillingCustomer = customer.clone().into();
    let applied = in_event_tx(state, event, |conn| queries::upsert_billing_customer(conn, &cached)).await?;
    Ok(match applied {
        Some(()) => {
            tracing::info!(customer_id = %cached.customer_id, "billing customer cached");
            Handled::quiet("Customer saved")
        }
        None => Handled::quiet("Already processed"),
    })
}

/// Customer contact data, preferring the local cache over a provider lookup.
async fn resolve_customer(state: &AppState, customer_id: &str) -> Result<BillingCustomer> {
    let cached = {
        let conn = state.db.get()?;
        queries::get_billing_customer(&conn, customer_id)?
    };
    if let Some(customer) = cached.filter(|c| c.email.is_some()) {
        return Ok(customer);
    }

    tracing::warn!(customer_id, "customer not cached yet, asking the billing provider");
    let customer = state.billing_api.retrieve_customer(customer_id).await?;
    {
        let conn = state.db.get()?;
        queries::upsert_billing_customer(&conn, &customer)?;
    }
    Ok(customer)
}

async fn subscription_created(
    state: &AppState,
    event: &DecodedEvent,
    sub: &StripeSubscription,
) -> Result<Handled> {
    let Some(transition) = transitions::for_new_subscription(sub) else {
        in_event_tx(state, event, |_| Ok(())).await?;
        return Ok(Handled::quiet("Subscription not live"));
    };
    provision_subscription(state, event, sub, transition).await
}

/// Build the provisioning request for a subscription from its prices and customer.
async fn subscription_request(
    state: &AppState,
    event: &DecodedEvent,
    sub: &StripeSubscription,
    transition: Transition,
) -> Result<ProvisionRequest> {
    let (skus, family) = {
        let conn = state.db.get()?;
        let mut skus = Vec::new();
        for price_id in sub.price_ids() {
            for sku in catalog::skus_for_price(&conn, price_id)? {
                if !skus.contains(&sku) {
                    skus.push(sku);
                }
            }
        }
        let Some(first) = skus.first() else {
            return Err(AppError::UpstreamInconsistency(format!(
                "no product mapped to prices {:?} of subscription {}",
                sub.price_ids(),
                sub.id
            )));
        };
        let family = catalog::family_for_sku(&conn, first)?.ok_or_else(|| {
            AppError::UpstreamInconsistency(format!("product {} has no family", first))
        })?;
        (skus, family)
    };

    let customer = resolve_customer(state, &sub.customer).await?;
    let Some(email) = customer.email.clone() else {
        return Err(AppError::UpstreamInconsistency(format!(
            "customer {} has no e-mail",
            sub.customer
        )));
    };

    let req = ProvisionRequest {
        email,
        family,
        skus,
        origin: Origin::Stripe,
        status: transition.status,
        expires_at: transition.expiry,
        trial_expires_at: None,
        contact: LicenseContact {
            stripe_customer_id: Some(sub.customer.clone()),
            phone: customer.phone.clone(),
            locale: customer.locale.clone(),
            mac_address: None,
        },
        platform_subscription_id: Some(sub.id.clone()),
        grant_source: format!("stripe_sub:{}", sub.id),
        billing_event_at: Some(event.created),
    };
    req.validate()?;
    Ok(req)
}

async fn provision_subscription(
    state: &AppState,
    event: &DecodedEvent,
    sub: &StripeSubscription,
    transition: Transition,
) -> Result<Handled> {
    let req = subscription_request(state, event, sub, transition).await?;

    let Some(outcome) = in_event_tx(state, event, |conn| provisioning::provision_tx(conn, &req)).await? else {
        return Ok(Handled::quiet("Already processed"));
    };

    if outcome.granted_skus.is_empty() {
        tracing::info!(subscription_id = %sub.id, "subscription already provisioned");
        return Ok(Handled::quiet("Subscription already provisioned"));
    }

    tracing::info!(
        subscription_id = %sub.id,
        license_id = %outcome.license_id,
        skus = ?outcome.granted_skus,
        "subscription provisioned"
    );
    Ok(Handled {
        body: "Entitlement provisioned",
        notifications: provisioning::notifications_for(&req, &outcome),
    })
}

async fn subscription_updated(
    state: &AppState,
    event: &DecodedEvent,
    sub: &StripeSubscription,
) -> Result<Handled> {
    let known = {
        let conn = state.db.get()?;
        !queries::list_entitlements_for_subscription(&conn, &sub.id)?.is_empty()
    };

    if !known {
        // Update overtook the creation event: its payload is a full snapshot, so provision from it
        return match transitions::for_new_subscription(sub) {
            Some(transition) => provision_subscription(state, event, sub, transition).await,
            None => {
                in_event_tx(state, event, |_| Ok(())).await?;
                Ok(Handled::quiet("Subscription not live"))
            }
        };
    }

    apply_to_subscription(state, event, &sub.id, |current| {
        transitions::for_subscription_update(sub, current.status)
    })
    .await
}

/// Apply the transition `pick` chooses for each entitlement of a subscription.
/// Returns the number of rows changed.
fn transition_entitlements<F>(
    conn: &Connection,
    event: &DecodedEvent,
    subscription_id: &str,
    pick: &F,
) -> Result<usize>
where
    F: Fn(&Entitlement) -> Option<Transition>,
{
    let mut changed = 0;
    for entitlement in queries::list_entitlements_for_subscription(conn, subscription_id)? {
        let Some(transition) = pick(&entitlement) else {
            continue;
        };

        match transitions::guard(&entitlement, event.created) {
            Err(Skip::Revoked) => {
                tracing::debug!(entitlement_id = %entitlement.id, "entitlement revoked, ignoring event");
                continue;
            }
            // Revocation is final whatever order it arrives in
            Err(Skip::Stale) if transition.status != EntitlementStatus::Revoked => {
                tracing::info!(
                    entitlement_id = %entitlement.id,
                    event_id = %event.id,
                    "newer billing event already applied, ignoring"
                );
                continue;
            }
            _ => {}
        }
        let expiry_column = if entitlement.origin.is_trial() {
            "trial_expires_at"
        } else {
            "expires_at"
        };
        queries::apply_entitlement_transition(
            conn,
            &entitlement.id,
            transition.status,
            expiry_column,
            transition.expiry,
            event.created,
        )?;
        tracing::info!(
            entitlement_id = %entitlement.id,
            sku = %entitlement.product_sku,
            from = entitlement.status.as_ref(),
            to = transition.status.as_ref(),
            expiry = ?transition.expiry,
            "entitlement transitioned"
        );
        changed += 1;
    }
    Ok(changed)
}

async fn apply_to_subscription<F>(
    state: &AppState,
    event: &DecodedEvent,
    subscription_id: &str,
    pick: F,
) -> Result<Handled>
where
    F: Fn(&Entitlement) -> Option<Transition>,
{
    let changed = in_event_tx(state, event, |conn| {
        transition_entitlements(conn, event, subscription_id, &pick)
    })
    .await?;

    Ok(match changed {
        None => Handled::quiet("Already processed"),
        Some(0) => {
            tracing::info!(subscription_id, event_type = %event.event_type, "no entitlement changed");
            Handled::quiet("No change")
        }
        Some(_) => Handled::quiet("Entitlements updated"),
    })
}

async fn invoice_paid(state: &AppState, event: &DecodedEvent, invoice: &StripeInvoice) -> Result<Handled> {
    let Some(subscription_id) = invoice.subscription_id() else {
        return Ok(Handled::quiet("No subscription"));
    };
    if invoice.amount_paid <= 0 {
        tracing::info!(invoice_id = %invoice.id, "zero-amount invoice ignored");
        return Ok(Handled::quiet("Zero-amount invoice ignored"));
    }

    let known = {
        let conn = state.db.get()?;
        !queries::list_entitlements_for_subscription(&conn, subscription_id)?.is_empty()
    };

    // Payment overtook the creation event: provision from the provider's snapshot
    let unseen = if known {
        None
    } else {
        tracing::warn!(
            invoice_id = %invoice.id,
            subscription_id,
            "invoice paid before subscription was seen, asking the billing provider"
        );
        Some(state.billing_api.retrieve_subscription(subscription_id).await?)
    };

    let period_end = match (invoice.period_end(), &unseen) {
        (Some(end), _) => Some(end),
        (None, Some(sub)) => sub.period_end(),
        (None, None) => state
            .billing_api
            .retrieve_subscription(subscription_id)
            .await?
            .period_end(),
    };

    let provision = match &unseen {
        Some(sub) => {
            let transition = transitions::for_new_subscription(sub).ok_or_else(|| {
                AppError::UpstreamInconsistency(format!(
                    "invoice {} paid for subscription {} that is {}",
                    invoice.id, subscription_id, sub.status
                ))
            })?;
            Some(subscription_request(state, event, sub, transition).await?)
        }
        None => None,
    };

    let entry = LedgerEntry {
        transaction_id: invoice.id.clone(),
        subscription_id: subscription_id.to_string(),
        amount_minor: invoice.amount_paid,
        currency: invoice.currency.clone(),
        occurred_at: invoice.created.unwrap_or(event.created),
    };
    let transition = transitions::for_invoice_paid(period_end);
    let pick = |_: &Entitlement| Some(transition);

    let applied = in_event_tx(state, event, |conn| {
        let provisioned = match &provision {
            Some(req) => Some(provisioning::provision_tx(conn, req)?),
            None => None,
        };
        if queries::list_entitlements_for_subscription(conn, subscription_id)?.is_empty() {
            return Err(AppError::UpstreamInconsistency(format!(
                "invoice {} paid for unknown subscription {}",
                invoice.id, subscription_id
            )));
        }
        transition_entitlements(conn, event, subscription_id, &pick)?;
        ledger::record_payment(conn, &entry)?;
        Ok(provisioned)
    })
    .await?;

    let Some(provisioned) = applied else {
        return Ok(Handled::quiet("Already processed"));
    };

    let notifications = match (&provision, &provisioned) {
        (Some(req), Some(outcome)) if !outcome.granted_skus.is_empty() => {
            tracing::info!(
                subscription_id,
                license_id = %outcome.license_id,
                skus = ?outcome.granted_skus,
                "subscription provisioned from paid invoice"
            );
            provisioning::notifications_for(req, outcome)
        }
        _ => Vec::new(),
    };
    Ok(Handled {
        body: "Renewal processed",
        notifications,
    })
}

async fn credit_note_created(
    state: &AppState,
    event: &DecodedEvent,
    note: &StripeCreditNote,
) -> Result<Handled> {
    let local = {
        let conn = state.db.get()?;
        queries::get_ledger_transaction(&conn, &note.invoice)?.map(|t| t.subscription_id)
    };
    let subscription_id = match local {
        Some(id) => id,
        None => {
            tracing::warn!(invoice_id = %note.invoice, "refunded invoice not in ledger, asking the billing provider");
            let invoice = state.billing_api.retrieve_invoice(&note.invoice).await?;
            invoice.subscription_id().map(String::from).ok_or_else(|| {
                AppError::UpstreamInconsistency(format!(
                    "credit note {} refers to invoice {} without subscription",
                    note.id, note.invoice
                ))
            })?
        }
    };

    let entry = LedgerEntry {
        transaction_id: note.id.clone(),
        subscription_id,
        amount_minor: note.total,
        currency: note.currency.clone(),
        occurred_at: note.created.unwrap_or(event.created),
    };
    let applied = in_event_tx(state, event, |conn| ledger::record_refund(conn, &entry)).await?;

    Ok(match applied {
        None => Handled::quiet("Already processed"),
        Some(_) => Handled::quiet("Refund recorded"),
    })
}
