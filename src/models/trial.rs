use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrialAttemptOutcome {
    Granted,
    Denied,
}

/// One trial request, kept whether or not it was granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialAttempt {
    pub id: String,
    pub email: String,
    pub mac_address: Option<String>,
    pub product_sku: String,
    pub family: String,
    pub outcome: TrialAttemptOutcome,
    pub reason: Option<String>,
    pub attempted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CounterKind {
    Email,
    Mac,
}

/// Per-credential attempt totals for abuse-rate reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialAttemptCounter {
    pub kind: CounterKind,
    pub value: String,
    pub attempts: i64,
    pub denied: i64,
    pub last_attempt_at: i64,
}
