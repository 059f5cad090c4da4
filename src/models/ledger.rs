use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LedgerKind {
    Payment,
    Refund,
}

/// Write-once record of a provider transaction applied to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub provider_transaction_id: String,
    pub kind: LedgerKind,
    pub subscription_id: String,
    pub license_id: Option<String>,
    pub family: Option<String>,
    /// Signed delta actually applied, in minor units
    pub amount_minor: i64,
    pub currency: String,
    pub occurred_at: i64,
    pub recorded_at: i64,
}

/// Running gross for one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueTotal {
    pub currency: String,
    pub gross_minor: i64,
}
