//! Client-side license checks: is this key good for this SKU on this machine?

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

use crate::db::{AppState, queries, retry_transient};
use crate::error::{AppError, Result};
use crate::keys::normalize_mac;
use crate::models::Entitlement;
use crate::util::now;

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub license_key: String,
    pub mac_address: String,
    pub product_sku: String,
    /// Version the client is running, compared against the catalog
    #[serde(default, alias = "product_version")]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InvalidReason {
    KeyNotFound,
    NoActiveEntitlement,
    MacMismatch,
}

impl InvalidReason {
    fn message(&self) -> &'static str {
        match self {
            InvalidReason::KeyNotFound => "License key not found.",
            InvalidReason::NoActiveEntitlement => "No active entitlement for this product.",
            InvalidReason::MacMismatch => "License key is bound to another machine.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationResult {
    Valid {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        latest_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        update_url: Option<String>,
    },
    Invalid {
        reason: InvalidReason,
        message: String,
    },
}

impl ValidationResult {
    fn invalid(reason: InvalidReason) -> Self {
        ValidationResult::Invalid {
            reason,
            message: reason.message().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }
}

/// Whether an entitlement lets its holder use the product at `now`.
pub fn entitlement_usable(entitlement: &Entitlement, now: i64) -> bool {
    entitlement.status.grants_access()
        && match entitlement.effective_expiry() {
            Some(expiry) => expiry > now,
            // Trials always carry an expiry; a missing one is not perpetual
            None => !entitlement.origin.is_trial(),
        }
}

/// Check a key inside the caller's transaction. Binds the MAC on first use.
pub fn validate_tx(conn: &Connection, req: &ValidateRequest, at: i64) -> Result<ValidationResult> {
    let key = req.license_key.trim();
    let sku = req.product_sku.trim();
    let mac = normalize_mac(&req.mac_address)
        .ok_or_else(|| AppError::BadRequest("mac_address is required".into()))?;
    if key.is_empty() || sku.is_empty() {
        return Err(AppError::BadRequest(
            "license_key and product_sku are required".into(),
        ));
    }

    let Some(license) = queries::get_license_by_key(conn, key)? else {
        return Ok(ValidationResult::invalid(InvalidReason::KeyNotFound));
    };

    let usable = queries::list_entitlements_for_license_sku(conn, &license.id, sku)?
        .iter()
        .any(|e| entitlement_usable(e, at));
    if !usable {
        return Ok(ValidationResult::invalid(InvalidReason::NoActiveEntitlement));
    }

    match license.mac_address.as_deref() {
        None => {
            // Lost a race with another first validation; re-check what won
            if !queries::bind_license_mac(conn, &license.id, &mac)? {
                let bound = queries::get_license_by_id(conn, &license.id)?
                    .and_then(|l| l.mac_address);
                if bound.as_deref() != Some(mac.as_str()) {
                    return Ok(ValidationResult::invalid(InvalidReason::MacMismatch));
                }
            } else {
                tracing::info!(license_id = %license.id, mac = %mac, "bound license to machine");
            }
        }
        Some(bound) if bound != mac => {
            return Ok(ValidationResult::invalid(InvalidReason::MacMismatch));
        }
        Some(_) => {}
    }

    let mut latest_version = None;
    let mut update_url = None;
    if let (Some(client), Some(product)) = (
        req.client_version.as_deref().map(str::trim).filter(|v| !v.is_empty()),
        queries::get_product(conn, sku)?,
    ) && let Some(latest) = product.latest_version.filter(|v| !v.trim().is_empty())
        && latest != client
    {
        latest_version = Some(latest);
        update_url = product.download_url;
    }

    Ok(ValidationResult::Valid {
        message: "License is valid.".to_string(),
        latest_version,
        update_url,
    })
}

pub async fn validate_license(state: &AppState, req: ValidateRequest) -> Result<ValidationResult> {
    let result = retry_transient(state.config.db_retry_attempts, || {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = validate_tx(&tx, &req, now())?;
        tx.commit()?;
        Ok(result)
    })
    .await?;

    if let ValidationResult::Invalid { reason, .. } = &result {
        tracing::debug!(sku = %req.product_sku, reason = reason.as_ref(), "validation failed");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::{EntitlementStatus, LicenseContact, Origin, Product, ProductFamily};

    const NOW: i64 = 1_700_000_000;

    fn setup() -> (Connection, String) {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        init_db(&conn).unwrap();
        queries::upsert_family(
            &conn,
            &ProductFamily {
                name: "grid".into(),
                display_name: "Grid".into(),
                trial_duration_days: None,
                support_email: None,
            },
        )
        .unwrap();
        queries::upsert_product(
            &conn,
            &Product {
                sku: "grid-axis".into(),
                name: "Axis".into(),
                family: "grid".into(),
                stripe_price_id: None,
                latest_version: Some("2.1.0".into()),
                download_url: Some("https://dl.example.com/axis".into()),
            },
        )
        .unwrap();
        let license = queries::insert_license(
            &conn,
            "a@x.com",
            "grid",
            "GRID-AAAA-BBBB-CCCC",
            &LicenseContact::default(),
        )
        .unwrap();
        (conn, license.id)
    }

    fn entitle(conn: &Connection, license_id: &str, origin: Origin, status: EntitlementStatus, expiry: Option<i64>) {
        let trial = origin.is_trial();
        queries::insert_entitlement(
            conn,
            &queries::NewEntitlement {
                license_id,
                product_sku: "grid-axis",
                status,
                origin: &origin,
                expires_at: if trial { None } else { expiry },
                trial_expires_at: if trial { expiry } else { None },
                platform_subscription_id: None,
                billing_event_at: None,
            },
        )
        .unwrap();
    }

    fn request(mac: &str, version: Option<&str>) -> ValidateRequest {
        ValidateRequest {
            license_key: "GRID-AAAA-BBBB-CCCC".into(),
            mac_address: mac.into(),
            product_sku: "grid-axis".into(),
            client_version: version.map(String::from),
        }
    }

    #[test]
    fn unknown_key_is_invalid() {
        let (conn, _) = setup();
        let mut req = request("aa:bb", None);
        req.license_key = "NOPE".into();
        assert_eq!(
            validate_tx(&conn, &req, NOW).unwrap(),
            ValidationResult::invalid(InvalidReason::KeyNotFound)
        );
    }

    #[test]
    fn binds_mac_on_first_use_then_enforces_it() {
        let (conn, license_id) = setup();
        entitle(&conn, &license_id, Origin::Manual, EntitlementStatus::Active, None);

        assert!(validate_tx(&conn, &request("aa-bb-cc", None), NOW).unwrap().is_valid());
        let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
        assert_eq!(license.mac_address.as_deref(), Some("AA:BB:CC"));

        assert!(validate_tx(&conn, &request("AA:BB:CC", None), NOW).unwrap().is_valid());
        assert_eq!(
            validate_tx(&conn, &request("11:22:33", None), NOW).unwrap(),
            ValidationResult::invalid(InvalidReason::MacMismatch)
        );
    }

    #[test]
    fn expired_or_blocked_entitlements_do_not_validate() {
        let (conn, license_id) = setup();
        entitle(&conn, &license_id, Origin::Stripe, EntitlementStatus::Active, Some(NOW - 1));
        entitle(&conn, &license_id, Origin::Manual, EntitlementStatus::Suspended, None);
        entitle(&conn, &license_id, Origin::Trial, EntitlementStatus::Trial, Some(NOW - 10));

        assert_eq!(
            validate_tx(&conn, &request("aa:bb", None), NOW).unwrap(),
            ValidationResult::invalid(InvalidReason::NoActiveEntitlement)
        );
        let license = queries::get_license_by_id(&conn, &license_id).unwrap().unwrap();
        assert!(license.mac_address.is_none(), "failed validation must not bind");
    }

    #[test]
    fn running_trial_validates() {
        let (conn, license_id) = setup();
        entitle(&conn, &license_id, Origin::Trial, EntitlementStatus::Trial, Some(NOW + 60));
        assert!(validate_tx(&conn, &request("aa:bb", None), NOW).unwrap().is_valid());
    }

    #[test]
    fn reports_update_when_client_is_behind() {
        let (conn, license_id) = setup();
        entitle(&conn, &license_id, Origin::Manual, EntitlementStatus::Active, None);

        match validate_tx(&conn, &request("aa:bb", Some("2.0.0")), NOW).unwrap() {
            ValidationResult::Valid {
                latest_version,
                update_url,
                ..
            } => {
                assert_eq!(latest_version.as_deref(), Some("2.1.0"));
                assert_eq!(update_url.as_deref(), Some("https://dl.example.com/axis"));
            }
            other => panic!("expected valid, got {:?}", other),
        }

        let current = validate_tx(&conn, &request("aa:bb", Some("2.1.0")), NOW).unwrap();
        assert!(matches!(
            current,
            ValidationResult::Valid { latest_version: None, update_url: None, .. }
        ));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let (conn, _) = setup();
        assert!(matches!(
            validate_tx(&conn, &request("  ", None), NOW),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn serializes_with_status_tag() {
        let json = serde_json::to_value(ValidationResult::invalid(InvalidReason::MacMismatch)).unwrap();
        assert_eq!(json["status"], "invalid");
        assert_eq!(json["reason"], "mac_mismatch");
    }
}
