//! The write path that turns trials, admin grants and purchases into
//! licenses and entitlements.

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::db::{AppState, queries, retry_transient};
use crate::error::{AppError, Result};
use crate::keys::{self, normalize_mac};
use crate::models::{
    EntitlementStatus, License, LicenseContact, Origin, TrialAttempt, TrialAttemptOutcome,
};
use crate::notify::{self, DomainEvent, Notification, TriggerEvent};
use crate::util::{days_from, gen_id, now};

const KEY_GENERATION_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub email: String,
    pub family: String,
    pub skus: Vec<String>,
    pub origin: Origin,
    pub status: EntitlementStatus,
    pub expires_at: Option<i64>,
    pub trial_expires_at: Option<i64>,
    pub contact: LicenseContact,
    pub platform_subscription_id: Option<String>,
    pub grant_source: String,
    /// `created` time of the billing event driving this call, if any
    pub billing_event_at: Option<i64>,
}

impl ProvisionRequest {
    /// Reject malformed input before any storage access.
    pub fn validate(&self) -> Result<()> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::BadRequest(format!("invalid email: {:?}", self.email)));
        }
        if self.family.trim().is_empty() {
            return Err(AppError::BadRequest("family is required".into()));
        }
        if self.skus.iter().all(|s| s.trim().is_empty()) {
            return Err(AppError::BadRequest("at least one product SKU is required".into()));
        }
        if self.grant_source.trim().is_empty() {
            return Err(AppError::BadRequest("grant source is required".into()));
        }
        if self.origin.is_trial() {
            if self.trial_expires_at.is_none() {
                return Err(AppError::BadRequest("trial grants need a trial expiry".into()));
            }
            if self.expires_at.is_some() {
                return Err(AppError::BadRequest("trial grants cannot carry a paid expiry".into()));
            }
        } else if self.trial_expires_at.is_some() {
            return Err(AppError::BadRequest(
                "only trial grants carry a trial expiry".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub license_id: String,
    pub license_key: String,
    pub was_new_license: bool,
    /// Expanded SKUs that received a new or refreshed entitlement
    pub granted_skus: Vec<String>,
    /// Expanded SKUs skipped because the subscription already provisioned them
    pub skipped_skus: Vec<String>,
}

/// Rule-based e-mail tag for a grant, if the origin has one.
pub fn trigger_for(origin: &Origin, was_new_license: bool) -> Option<TriggerEvent> {
    match origin {
        Origin::Trial => Some(TriggerEvent::TrialStarted),
        Origin::Stripe => Some(TriggerEvent::SubscriptionStarted),
        Origin::Manual | Origin::Beta | Origin::Youtuber | Origin::Support => Some(if was_new_license {
            TriggerEvent::AdminGrantCreated
        } else {
            TriggerEvent::AdminGrantAdded
        }),
        Origin::Other(_) => None,
    }
}

fn find_or_create_license(
    conn: &Connection,
    email: &str,
    family: &str,
    contact: &LicenseContact,
) -> Result<(License, bool)> {
    if let Some(license) = queries::find_license(conn, email, family)? {
        return Ok((license, false));
    }

    for _ in 0..KEY_GENERATION_ATTEMPTS {
        let key = keys::generate_key(family);
        if queries::license_key_exists(conn, &key)? {
            tracing::warn!(family, "license key collision, regenerating");
            continue;
        }
        let license = queries::insert_license(conn, email, family, &key, contact)?;
        return Ok((license, true));
    }

    Err(AppError::Internal(format!(
        "could not generate a unique license key for family {}",
        family
    )))
}

/// Provision inside a transaction owned by the caller.
///
/// Does not check the trial fingerprint; callers that grant trials do that
/// first so retried calls stay idempotent.
pub fn provision_tx(conn: &Connection, req: &ProvisionRequest) -> Result<ProvisionOutcome> {
    let email = req.email.trim();
    let family = req.family.trim();
    let contact = LicenseContact {
        mac_address: req.contact.mac_address.as_deref().and_then(normalize_mac),
        ..req.contact.clone()
    };

    let (license, was_new_license) = find_or_create_license(conn, email, family, &contact)?;

    if !was_new_license {
        // An existing customer paying through the provider gets to activate on a new machine
        let clear_mac = req.origin == Origin::Stripe;
        if clear_mac && license.mac_address.is_some() {
            tracing::info!(license_id = %license.id, "clearing MAC binding for new purchase");
        }
        queries::backfill_license(conn, &license.id, &contact, clear_mac)?;
    }

    let skus = catalog::expand(conn, &req.skus)?;
    let mut granted_skus = Vec::new();
    let mut skipped_skus = Vec::new();

    for sku in skus {
        let entitlement = match req.platform_subscription_id.as_deref() {
            Some(subscription_id) => {
                if queries::find_entitlement_by_subscription(conn, subscription_id, &sku)?.is_some() {
                    tracing::debug!(subscription_id, sku = %sku, "already provisioned, skipping");
                    skipped_skus.push(sku);
                    continue;
                }
                None
            }
            None => queries::find_reusable_entitlement(conn, &license.id, &sku, &req.origin)?,
        };

        let entitlement_id = match entitlement {
            Some(existing) => {
                queries::refresh_entitlement(
                    conn,
                    &existing.id,
                    req.status,
                    req.expires_at,
                    req.trial_expires_at,
                )?;
                existing.id
            }
            None => {
                queries::insert_entitlement(
                    conn,
                    &queries::NewEntitlement {
                        license_id: &license.id,
                        product_sku: &sku,
                        status: req.status,
                        origin: &req.origin,
                        expires_at: req.expires_at,
                        trial_expires_at: req.trial_expires_at,
                        platform_subscription_id: req.platform_subscription_id.as_deref(),
                        billing_event_at: req.billing_event_at,
                    },
                )?
                .id
            }
        };

        queries::insert_grant(conn, &entitlement_id, &req.grant_source)?;
        granted_skus.push(sku);
    }

    Ok(ProvisionOutcome {
        license_id: license.id,
        license_key: license.license_key,
        was_new_license,
        granted_skus,
        skipped_skus,
    })
}

/// Notifications owed for a committed provisioning call.
pub fn notifications_for(req: &ProvisionRequest, outcome: &ProvisionOutcome) -> Vec<Notification> {
    let mut notifications = Vec::new();
    let email = req.email.trim();
    let family = req.family.trim();

    if outcome.was_new_license {
        notifications.push(Notification::LicenseKey {
            email: email.to_string(),
            license_key: outcome.license_key.clone(),
            family: family.to_string(),
        });
    }

    if outcome.granted_skus.is_empty() {
        return notifications;
    }

    if let Some(trigger) = trigger_for(&req.origin, outcome.was_new_license) {
        notifications.push(Notification::RuleBased(DomainEvent {
            trigger_event: trigger,
            family: family.to_string(),
            email: email.to_string(),
            license_key: Some(outcome.license_key.clone()),
            trial_end_date: req.trial_expires_at,
            granted_skus: outcome.granted_skus.clone(),
        }));
    }

    notifications.push(Notification::admin_alert(
        family,
        format!("New license ({}) for family '{}'", req.origin, family),
        format!(
            "Entitlement granted to {} in family '{}'. SKUs: {}",
            email,
            family,
            outcome.granted_skus.join(", ")
        ),
    ));

    notifications
}

/// Provision in its own transaction, then notify.
pub async fn provision(state: &AppState, req: ProvisionRequest) -> Result<ProvisionOutcome> {
    req.validate()?;

    let outcome = retry_transient(state.config.db_retry_attempts, || {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = provision_tx(&tx, &req)?;
        tx.commit()?;
        Ok(outcome)
    })
    .await?;

    tracing::info!(
        license_id = %outcome.license_id,
        family = %req.family,
        origin = %req.origin,
        new_license = outcome.was_new_license,
        granted = ?outcome.granted_skus,
        "provisioned"
    );

    notify::dispatch(state.notifier.as_ref(), notifications_for(&req, &outcome)).await;
    Ok(outcome)
}

// ============ Trials ============

#[derive(Debug, Clone, Deserialize)]
pub struct TrialRequest {
    pub email: String,
    pub mac_address: Option<String>,
    pub product_sku: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    #[serde(rename = "trial_started")]
    Started {
        license_key: String,
        expires_at: i64,
        granted_skus: Vec<String>,
    },
    Denied { reason: String },
}

/// Grant a trial for the whole family of `product_sku`, unless this e-mail
/// or machine already had one there.
pub async fn start_trial(state: &AppState, req: TrialRequest) -> Result<TrialOutcome> {
    let email = req.email.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest(format!("invalid email: {:?}", req.email)));
    }
    let sku = req.product_sku.trim().to_string();
    if sku.is_empty() {
        return Err(AppError::BadRequest("product_sku is required".into()));
    }
    let mac = req.mac_address.as_deref().and_then(normalize_mac);

    let (outcome, notifications) = retry_transient(state.config.db_retry_attempts, || {
        let mut conn = state.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let family = catalog::family_for_sku(&tx, &sku)?
            .ok_or_else(|| AppError::NotFound(format!("product {}", sku)))?;

        let mut attempt = TrialAttempt {
            id: gen_id(),
            email: email.clone(),
            mac_address: mac.clone(),
            product_sku: sku.clone(),
            family: family.clone(),
            outcome: TrialAttemptOutcome::Granted,
            reason: None,
            attempted_at: now(),
        };

        if keys::trial_fingerprint_exists(&tx, &email, mac.as_deref(), &family)? {
            let reason = format!(
                "trial already used for this e-mail or machine in family {}",
                family
            );
            attempt.outcome = TrialAttemptOutcome::Denied;
            attempt.reason = Some(reason.clone());
            queries::record_trial_attempt(&tx, &attempt)?;
            tx.commit()?;

            let denied = Notification::RuleBased(DomainEvent {
                trigger_event: TriggerEvent::TrialDenied,
                family,
                email: email.clone(),
                license_key: None,
                trial_end_date: None,
                granted_skus: Vec::new(),
            });
            return Ok((TrialOutcome::Denied { reason }, vec![denied]));
        }

        let days = catalog::trial_duration_days(&tx, &family, state.config.default_trial_days)?;
        let trial_expires_at = days_from(attempt.attempted_at, days);
        let provision_req = ProvisionRequest {
            email: email.clone(),
            family: family.clone(),
            skus: catalog::all_skus_for_family(&tx, &family)?,
            origin: Origin::Trial,
            status: EntitlementStatus::Trial,
            expires_at: None,
            trial_expires_at: Some(trial_expires_at),
            contact: LicenseContact {
                mac_address: mac.clone(),
                phone: req.phone.clone(),
                locale: req.locale.clone(),
                stripe_customer_id: None,
            },
            platform_subscription_id: None,
            grant_source: format!("trial_{}", family),
            billing_event_at: None,
        };
        provision_req.validate()?;

        let provisioned = provision_tx(&tx, &provision_req)?;
        queries::record_trial_attempt(&tx, &attempt)?;
        tx.commit()?;

        let notifications = notifications_for(&provision_req, &provisioned);
        Ok((
            TrialOutcome::Started {
                license_key: provisioned.license_key,
                expires_at: trial_expires_at,
                granted_skus: provisioned.granted_skus,
            },
            notifications,
        ))
    })
    .await?;

    match &outcome {
        TrialOutcome::Started { granted_skus, .. } => {
            tracing::info!(email = %email, mac = ?mac, skus = ?granted_skus, "trial started")
        }
        TrialOutcome::Denied { reason } => {
            tracing::info!(email = %email, mac = ?mac, reason = %reason, "trial denied")
        }
    }

    notify::dispatch(state.notifier.as_ref(), notifications).await;
    Ok(outcome)
}

// ============ Admin grants ============

#[derive(Debug, Clone, Deserialize)]
pub struct AdminGrantRequest {
    pub email: String,
    pub product_skus: Vec<String>,
    pub origin: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Operator-issued grant. Every SKU must belong to the same family.
pub async fn admin_grant(state: &AppState, req: AdminGrantRequest) -> Result<ProvisionOutcome> {
    let origin = Origin::parse(&req.origin);
    if req.origin.trim().is_empty() {
        return Err(AppError::BadRequest("origin is required".into()));
    }
    if matches!(origin, Origin::Trial | Origin::Stripe) {
        return Err(AppError::BadRequest(format!(
            "origin '{}' is reserved for trials and purchases",
            origin
        )));
    }
    if req.product_skus.iter().all(|s| s.trim().is_empty()) {
        return Err(AppError::BadRequest("select at least one product".into()));
    }

    let family = {
        let conn = state.db.get()?;
        let mut families = Vec::new();
        for sku in req.product_skus.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let family = catalog::family_for_sku(&conn, sku)?
                .ok_or_else(|| AppError::NotFound(format!("product {}", sku)))?;
            if !families.contains(&family) {
                families.push(family);
            }
        }
        if families.len() > 1 {
            return Err(AppError::BadRequest(
                "all selected products must belong to the same family".into(),
            ));
        }
        families
            .pop()
            .ok_or_else(|| AppError::BadRequest("select at least one product".into()))?
    };

    let grant_source = format!("manual_admin_{}", origin);
    provision(
        state,
        ProvisionRequest {
            email: req.email,
            family,
            skus: req.product_skus,
            origin,
            status: EntitlementStatus::Active,
            expires_at: req.expires_at,
            trial_expires_at: None,
            contact: LicenseContact {
                phone: req.phone,
                locale: req.locale,
                ..Default::default()
            },
            platform_subscription_id: None,
            grant_source,
            billing_event_at: None,
        },
    )
    .await
}
