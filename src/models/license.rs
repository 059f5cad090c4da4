use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Deliverability of the address on file, fed by the e-mail provider's event webhook.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmailStatus {
    #[default]
    Ok,
    Bounced,
    SpamReport,
}

/// One purchasing identity within a product family. Holds a single key
/// that never rotates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    pub license_key: String,
    pub email: String,
    pub family: String,
    /// Bound on first validation or trial, cleared only by an operator or a new purchase
    pub mac_address: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub phone: Option<String>,
    pub locale: Option<String>,
    pub email_status: EmailStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Optional contact fields carried by a provisioning call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LicenseContact {
    #[serde(default)]
    pub stripe_customer_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
}
