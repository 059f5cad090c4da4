use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntitlementStatus {
    Trial,
    Active,
    AwaitingPayment,
    PendingCancellation,
    Suspended,
    Revoked,
}

impl EntitlementStatus {
    /// Statuses under which the product may be used (expiry permitting).
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            EntitlementStatus::Trial
                | EntitlementStatus::Active
                | EntitlementStatus::PendingCancellation
                | EntitlementStatus::AwaitingPayment
        )
    }
}

/// Where an entitlement came from. The set is open: operators invent new
/// promotional origins, which are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Trial,
    Stripe,
    Manual,
    Beta,
    Youtuber,
    Support,
    Other(String),
}

impl Origin {
    pub fn as_str(&self) -> &str {
        match self {
            Origin::Trial => "trial",
            Origin::Stripe => "stripe",
            Origin::Manual => "manual",
            Origin::Beta => "beta",
            Origin::Youtuber => "youtuber",
            Origin::Support => "suporte",
            Origin::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trial" => Origin::Trial,
            "stripe" => Origin::Stripe,
            "manual" => Origin::Manual,
            "beta" => Origin::Beta,
            "youtuber" => Origin::Youtuber,
            "suporte" | "support" => Origin::Support,
            other => Origin::Other(other.to_string()),
        }
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, Origin::Trial)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Origin::parse(&s))
    }
}

/// Usage right for one SKU under one license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    pub license_id: String,
    pub product_sku: String,
    pub status: EntitlementStatus,
    pub origin: Origin,
    /// Paid/manual expiry (None = perpetual). Always None for trial origin.
    pub expires_at: Option<i64>,
    /// Trial expiry. Always None for non-trial origin.
    pub trial_expires_at: Option<i64>,
    /// Billing provider subscription this entitlement is correlated with
    pub platform_subscription_id: Option<String>,
    /// `created` time of the last billing event applied to this row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_event_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Entitlement {
    /// The expiry that applies to this entitlement's origin.
    pub fn effective_expiry(&self) -> Option<i64> {
        if self.origin.is_trial() {
            self.trial_expires_at
        } else {
            self.expires_at
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementGrant {
    pub id: String,
    pub entitlement_id: String,
    pub grant_source: String,
    pub created_at: i64,
}

/// A (license, sku) pair backed by more than one subscription or grant.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateSubscription {
    pub license_id: String,
    pub email: String,
    pub family: String,
    pub product_sku: String,
    pub entitlement_count: i64,
    pub grant_count: i64,
    pub subscription_ids: Vec<String>,
}
