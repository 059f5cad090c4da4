use serde::{Deserialize, Serialize};

/// Local copy of the billing provider's customer record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingCustomer {
    pub customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub locale: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}
