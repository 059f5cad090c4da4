use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductFamily {
    pub name: String,
    pub display_name: String,
    /// Falls back to the configured default when unset
    pub trial_duration_days: Option<i64>,
    pub support_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub family: String,
    pub stripe_price_id: Option<String>,
    pub latest_version: Option<String>,
    pub download_url: Option<String>,
}
