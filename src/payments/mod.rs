mod stripe;

pub use stripe::*;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::BillingCustomer;

/// Read-only lookups against the billing provider, used when the local
/// cache has not caught up with the event stream.
#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<BillingCustomer>;
    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<StripeSubscription>;
    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<StripeInvoice>;
}
