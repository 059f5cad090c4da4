//! Row mapping for the models stored in SQLite.

use std::str::FromStr;

use rusqlite::{Connection, Params, Row, types::Type};

use crate::error::Result;
use crate::models::*;

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

pub const LICENSE_COLS: &str = "id, license_key, email, family, mac_address, stripe_customer_id, \
     phone, locale, email_status, created_at, updated_at";

pub const ENTITLEMENT_COLS: &str = "id, license_id, product_sku, status, origin, expires_at, \
     trial_expires_at, platform_subscription_id, billing_event_at, created_at, updated_at";

pub const GRANT_COLS: &str = "id, entitlement_id, grant_source, created_at";

pub const TRIAL_ATTEMPT_COLS: &str =
    "id, email, mac_address, product_sku, family, outcome, reason, attempted_at";

pub const TRIAL_COUNTER_COLS: &str = "kind, value, attempts, denied, last_attempt_at";

pub const CUSTOMER_COLS: &str = "customer_id, email, name, phone, locale, updated_at";

pub const LEDGER_TRANSACTION_COLS: &str = "provider_transaction_id, kind, subscription_id, \
     license_id, family, amount_minor, currency, occurred_at, recorded_at";

pub const FAMILY_COLS: &str = "name, display_name, trial_duration_days, support_email";

pub const PRODUCT_COLS: &str =
    "sku, name, family, stripe_price_id, latest_version, download_url";

/// Parse a TEXT column into a strum enum, surfacing bad values as conversion errors.
fn parse_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl FromRow for License {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(License {
            id: row.get(0)?,
            license_key: row.get(1)?,
            email: row.get(2)?,
            family: row.get(3)?,
            mac_address: row.get(4)?,
            stripe_customer_id: row.get(5)?,
            phone: row.get(6)?,
            locale: row.get(7)?,
            email_status: parse_col(row, 8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

impl FromRow for Entitlement {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Entitlement {
            id: row.get(0)?,
            license_id: row.get(1)?,
            product_sku: row.get(2)?,
            status: parse_col(row, 3)?,
            origin: Origin::parse(&row.get::<_, String>(4)?),
            expires_at: row.get(5)?,
            trial_expires_at: row.get(6)?,
            platform_subscription_id: row.get(7)?,
            billing_event_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

impl FromRow for EntitlementGrant {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(EntitlementGrant {
            id: row.get(0)?,
            entitlement_id: row.get(1)?,
            grant_source: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl FromRow for TrialAttempt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TrialAttempt {
            id: row.get(0)?,
            email: row.get(1)?,
            mac_address: row.get(2)?,
            product_sku: row.get(3)?,
            family: row.get(4)?,
            outcome: parse_col(row, 5)?,
            reason: row.get(6)?,
            attempted_at: row.get(7)?,
        })
    }
}

impl FromRow for TrialAttemptCounter {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TrialAttemptCounter {
            kind: parse_col(row, 0)?,
            value: row.get(1)?,
            attempts: row.get(2)?,
            denied: row.get(3)?,
            last_attempt_at: row.get(4)?,
        })
    }
}

impl FromRow for BillingCustomer {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(BillingCustomer {
            customer_id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            locale: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

impl FromRow for LedgerTransaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerTransaction {
            provider_transaction_id: row.get(0)?,
            kind: parse_col(row, 1)?,
            subscription_id: row.get(2)?,
            license_id: row.get(3)?,
            family: row.get(4)?,
            amount_minor: row.get(5)?,
            currency: row.get(6)?,
            occurred_at: row.get(7)?,
            recorded_at: row.get(8)?,
        })
    }
}

impl FromRow for RevenueTotal {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RevenueTotal {
            currency: row.get(0)?,
            gross_minor: row.get(1)?,
        })
    }
}

impl FromRow for ProductFamily {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(ProductFamily {
            name: row.get(0)?,
            display_name: row.get(1)?,
            trial_duration_days: row.get(2)?,
            support_email: row.get(3)?,
        })
    }
}

impl FromRow for Product {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Product {
            sku: row.get(0)?,
            name: row.get(1)?,
            family: row.get(2)?,
            stripe_price_id: row.get(3)?,
            latest_version: row.get(4)?,
            download_url: row.get(5)?,
        })
    }
}

pub fn query_one<T: FromRow>(conn: &Connection, sql: &str, params: impl Params) -> Result<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(T::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn query_all<T: FromRow>(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| T::from_row(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
