use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result};
use crate::models::BillingCustomer;

use super::BillingApi;

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

// ============ Provider objects ============
//
// Only the fields the processor reads. Newer API versions moved the period
// end onto subscription items and the invoice's subscription under `parent`,
// so both locations are accepted.

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub preferred_locales: Vec<String>,
}

impl From<StripeCustomer> for BillingCustomer {
    fn from(c: StripeCustomer) -> Self {
        BillingCustomer {
            customer_id: c.id,
            email: c.email,
            name: c.name,
            phone: c.phone,
            locale: c.preferred_locales.into_iter().next(),
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub price: StripePrice,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub items: StripeList<StripeSubscriptionItem>,
}

impl StripeSubscription {
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.items.data.iter().find_map(|i| i.current_period_end))
    }

    pub fn price_ids(&self) -> Vec<&str> {
        self.items.data.iter().map(|i| i.price.id.as_str()).collect()
    }

    pub fn cancel_scheduled(&self) -> bool {
        self.cancel_at_period_end || self.cancel_at.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePeriod {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceLine {
    pub period: Option<StripePeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionDetails {
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoiceParent {
    pub subscription_details: Option<StripeSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub parent: Option<StripeInvoiceParent>,
    #[serde(default)]
    pub amount_paid: i64,
    pub currency: String,
    pub created: Option<i64>,
    #[serde(default)]
    pub lines: StripeList<StripeInvoiceLine>,
}

impl StripeInvoice {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    /// Latest service period end across the invoice lines.
    pub fn period_end(&self) -> Option<i64> {
        self.lines
            .data
            .iter()
            .filter_map(|l| l.period.as_ref().and_then(|p| p.end))
            .max()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCreditNote {
    pub id: String,
    pub invoice: String,
    /// Total refunded/credited, minor units
    pub total: i64,
    pub currency: String,
    pub created: Option<i64>,
}

// ============ Webhook signatures ============

/// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=...]`).
///
/// Returns Err when the header is malformed, Ok(false) when no signature
/// matches or the timestamp is outside the tolerance window.
pub fn verify_webhook_signature(
    secret: &str,
    payload: &[u8],
    signature_header: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<bool> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in signature_header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = Some(value),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| AppError::Authenticity("missing timestamp in signature".into()))?;
    if signatures.is_empty() {
        return Err(AppError::Authenticity("missing v1 signature".into()));
    }
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AppError::Authenticity("invalid signature timestamp".into()))?;

    if now.abs_diff(ts) > tolerance_secs.unsigned_abs() {
        tracing::warn!(timestamp = ts, "webhook signature timestamp outside tolerance");
        return Ok(false);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("HMAC init failed: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    Ok(signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes()))))
}

// ============ API client ============

/// Read-only Stripe API client used for fallback lookups.
#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: Option<String>,
    api_base: String,
}

impl StripeClient {
    pub fn new(secret_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            secret_key,
            api_base: STRIPE_API_BASE.to_string(),
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let secret_key = self
            .secret_key
            .as_deref()
            .ok_or_else(|| AppError::Upstream("STRIPE_SECRET_KEY is not configured".into()))?;

        let response = self
            .client
            .get(format!("{}/{}", self.api_base, path))
            .bearer_auth(secret_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            tracing::error!(%status, path, body = %text, "Stripe API lookup failed");
            return Err(AppError::Upstream(format!("Stripe API returned {}", status)));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl BillingApi for StripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<BillingCustomer> {
        let customer: StripeCustomer = self.get(&format!("customers/{}", customer_id)).await?;
        Ok(customer.into())
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<StripeSubscription> {
        self.get(&format!("subscriptions/{}", subscription_id)).await
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<StripeInvoice> {
        self.get(&format!("invoices/{}", invoice_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = sign(payload, SECRET, 1_700_000_000);
        assert!(verify_webhook_signature(SECRET, payload, &header, 300, 1_700_000_100).unwrap());
    }

    #[test]
    fn wrong_secret_or_modified_body_is_rejected() {
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = sign(payload, "wrong_secret", 1_700_000_000);
        assert!(!verify_webhook_signature(SECRET, payload, &header, 300, 1_700_000_000).unwrap());

        let header = sign(payload, SECRET, 1_700_000_000);
        let tampered = br#"{"type":"invoice.paid","x":1}"#;
        assert!(!verify_webhook_signature(SECRET, tampered, &header, 300, 1_700_000_000).unwrap());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = b"{}";
        let header = sign(payload, SECRET, 1_700_000_000);
        assert!(!verify_webhook_signature(SECRET, payload, &header, 300, 1_700_000_600).unwrap());
    }

    #[test]
    fn extreme_timestamps_are_rejected_without_overflow() {
        let header = format!("t={},v1=00", i64::MIN);
        assert!(!verify_webhook_signature(SECRET, b"{}", &header, 300, 1_700_000_000).unwrap());
        let header = format!("t={},v1=00", i64::MAX);
        assert!(!verify_webhook_signature(SECRET, b"{}", &header, 300, -1).unwrap());
    }

    #[test]
    fn one_matching_signature_among_several_is_enough() {
        let payload = b"{}";
        let good = sign(payload, SECRET, 1_700_000_000);
        let header = good.replacen(",v1=", ",v1=deadbeef,v1=", 1);
        assert!(verify_webhook_signature(SECRET, payload, &header, 300, 1_700_000_000).unwrap());
    }

    #[test]
    fn malformed_header_errors() {
        assert!(verify_webhook_signature(SECRET, b"{}", "v1=abc", 300, 0).is_err());
        assert!(verify_webhook_signature(SECRET, b"{}", "t=123", 300, 0).is_err());
        assert!(verify_webhook_signature(SECRET, b"{}", "t=abc,v1=00", 300, 0).is_err());
    }

    #[test]
    fn invoice_subscription_falls_back_to_parent() {
        let invoice: StripeInvoice = serde_json::from_value(serde_json::json!({
            "id": "in_1",
            "currency": "usd",
            "amount_paid": 4900,
            "parent": { "subscription_details": { "subscription": "sub_9" } },
            "lines": { "data": [
                { "period": { "start": 10, "end": 20 } },
                { "period": { "start": 10, "end": 30 } }
            ] }
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id(), Some("sub_9"));
        assert_eq!(invoice.period_end(), Some(30));
    }
}
