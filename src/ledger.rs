//! Gross revenue accumulators per subscription and per family-month.
//!
//! Totals are only ever adjusted by deltas, never recomputed, so each
//! provider transaction id is imported exactly once. Call these inside the
//! same transaction as the entitlement change the event causes.

use rusqlite::Connection;

use crate::db::queries;
use crate::error::{AppError, Result};
use crate::models::{LedgerKind, LedgerTransaction, RevenueTotal};
use crate::util::{month_key, now};

pub use queries::{family_month_revenue, license_revenue, subscription_revenue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Provider id of the payment (invoice) or refund (credit note)
    pub transaction_id: String,
    pub subscription_id: String,
    /// Positive amount in minor units
    pub amount_minor: i64,
    pub currency: String,
    pub occurred_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Signed delta added to both accumulators
    Applied { delta_minor: i64 },
    AlreadyRecorded,
}

fn owner(conn: &Connection, subscription_id: &str) -> Result<(String, String)> {
    queries::license_for_subscription(conn, subscription_id)?.ok_or_else(|| {
        AppError::UpstreamInconsistency(format!(
            "no license owns subscription {}",
            subscription_id
        ))
    })
}

fn apply(
    conn: &Connection,
    kind: LedgerKind,
    entry: &LedgerEntry,
    delta_minor: i64,
    license_id: &str,
    family: &str,
) -> Result<LedgerOutcome> {
    let currency = entry.currency.to_lowercase();
    let imported = queries::try_insert_ledger_transaction(
        conn,
        &LedgerTransaction {
            provider_transaction_id: entry.transaction_id.clone(),
            kind,
            subscription_id: entry.subscription_id.clone(),
            license_id: Some(license_id.to_string()),
            family: Some(family.to_string()),
            amount_minor: delta_minor,
            currency: currency.clone(),
            occurred_at: entry.occurred_at,
            recorded_at: now(),
        },
    )?;
    if !imported {
        tracing::debug!(transaction_id = %entry.transaction_id, "ledger transaction already recorded");
        return Ok(LedgerOutcome::AlreadyRecorded);
    }

    queries::add_subscription_revenue(
        conn,
        &entry.subscription_id,
        &currency,
        Some(license_id),
        delta_minor,
    )?;
    queries::add_family_month_revenue(
        conn,
        family,
        &month_key(entry.occurred_at),
        &currency,
        delta_minor,
    )?;

    tracing::info!(
        transaction_id = %entry.transaction_id,
        subscription_id = %entry.subscription_id,
        family,
        currency = %currency,
        delta_minor,
        "ledger updated"
    );
    Ok(LedgerOutcome::Applied { delta_minor })
}

/// Add a payment to the subscription total and its family's month bucket.
pub fn record_payment(conn: &Connection, entry: &LedgerEntry) -> Result<LedgerOutcome> {
    if entry.amount_minor < 0 {
        return Err(AppError::BadRequest("payment amount cannot be negative".into()));
    }
    let (license_id, family) = owner(conn, &entry.subscription_id)?;
    apply(
        conn,
        LedgerKind::Payment,
        entry,
        entry.amount_minor,
        &license_id,
        &family,
    )
}

/// Reverse a refund. The reversal is capped at what the subscription has
/// accumulated in that currency, so its total never goes negative.
pub fn record_refund(conn: &Connection, entry: &LedgerEntry) -> Result<LedgerOutcome> {
    if entry.amount_minor < 0 {
        return Err(AppError::BadRequest("refund amount cannot be negative".into()));
    }
    if queries::get_ledger_transaction(conn, &entry.transaction_id)?.is_some() {
        return Ok(LedgerOutcome::AlreadyRecorded);
    }

    let (license_id, family) = owner(conn, &entry.subscription_id)?;
    let recorded = queries::subscription_revenue_in(
        conn,
        &entry.subscription_id,
        &entry.currency.to_lowercase(),
    )?;
    let reversible = entry.amount_minor.min(recorded.max(0));
    if reversible < entry.amount_minor {
        tracing::warn!(
            subscription_id = %entry.subscription_id,
            requested = entry.amount_minor,
            recorded,
            "refund exceeds recorded revenue, clamping"
        );
    }
    apply(conn, LedgerKind::Refund, entry, -reversible, &license_id, &family)
}

/// Currency totals as a JSON-friendly map.
pub fn totals_by_currency(totals: &[RevenueTotal]) -> serde_json::Map<String, serde_json::Value> {
    totals
        .iter()
        .map(|t| (t.currency.clone(), serde_json::Value::from(t.gross_minor)))
        .collect()
}
