use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::payments::{StripeCreditNote, StripeCustomer, StripeInvoice, StripeSubscription};

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// Billing event kinds this service acts on.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CustomerUpserted(StripeCustomer),
    SubscriptionCreated(StripeSubscription),
    SubscriptionUpdated(StripeSubscription),
    SubscriptionDeleted(StripeSubscription),
    InvoicePaid(StripeInvoice),
    InvoicePaymentFailed(StripeInvoice),
    CreditNoteCreated(StripeCreditNote),
    /// Authentic but not handled here
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub id: String,
    pub event_type: String,
    /// Provider-side creation time, used to order state changes
    pub created: i64,
    pub kind: BillingEvent,
}

fn object<T: for<'de> Deserialize<'de>>(event_type: &str, object: Value) -> Result<T> {
    serde_json::from_value(object)
        .map_err(|e| AppError::BadRequest(format!("malformed {} payload: {}", event_type, e)))
}

/// Decode a raw webhook body. Known event types must carry a well-formed object.
pub fn decode(raw: &[u8]) -> Result<DecodedEvent> {
    let envelope: Envelope = serde_json::from_slice(raw)?;
    let Envelope {
        id,
        event_type,
        created,
        data,
    } = envelope;
    let obj = data.object;

    let kind = match event_type.as_str() {
        "customer.created" | "customer.updated" => {
            BillingEvent::CustomerUpserted(object(&event_type, obj)?)
        }
        "customer.subscription.created" => BillingEvent::SubscriptionCreated(object(&event_type, obj)?),
        "customer.subscription.updated" => BillingEvent::SubscriptionUpdated(object(&event_type, obj)?),
        "customer.subscription.deleted" => BillingEvent::SubscriptionDeleted(object(&event_type, obj)?),
        "invoice.paid" | "invoice.payment_succeeded" => {
            BillingEvent::InvoicePaid(object(&event_type, obj)?)
        }
        "invoice.payment_failed" => BillingEvent::InvoicePaymentFailed(object(&event_type, obj)?),
        "credit_note.created" => BillingEvent::CreditNoteCreated(object(&event_type, obj)?),
        _ => BillingEvent::Unknown,
    };

    Ok(DecodedEvent {
        id,
        event_type,
        created,
        kind,
    })
}
