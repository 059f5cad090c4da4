mod from_row;
pub mod queries;

pub use from_row::{FromRow, query_all, query_one};

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::config::Config;
use crate::error::Result;
use crate::notify::Notifier;
use crate::payments::BillingApi;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub notifier: Arc<dyn Notifier>,
    pub billing_api: Arc<dyn BillingApi>,
}

/// Build a pool whose connections all enforce foreign keys and wait on locks
/// instead of failing immediately.
pub fn create_pool(path: &str) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(())
    });
    let pool = Pool::builder().max_size(8).build(manager)?;
    Ok(pool)
}

/// Run `op` again while it fails with a transient storage error, up to
/// `attempts` tries in total. Each try must be self-contained (own transaction).
pub async fn retry_transient<T, F>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %e, "transient storage error, retrying");
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Catalog (owned by product management, read here)
        CREATE TABLE IF NOT EXISTS product_families (
            name TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            trial_duration_days INTEGER,
            support_email TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            sku TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            family TEXT NOT NULL REFERENCES product_families(name),
            stripe_price_id TEXT,
            latest_version TEXT,
            download_url TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_family ON products(family);
        CREATE INDEX IF NOT EXISTS idx_products_price ON products(stripe_price_id);

        CREATE TABLE IF NOT EXISTS suite_components (
            suite_sku TEXT NOT NULL,
            component_sku TEXT NOT NULL,
            PRIMARY KEY (suite_sku, component_sku)
        );

        -- Licenses: one per (email, family), case-insensitive
        CREATE TABLE IF NOT EXISTS licenses (
            id TEXT PRIMARY KEY,
            license_key TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            family TEXT NOT NULL,
            mac_address TEXT,
            stripe_customer_id TEXT,
            phone TEXT,
            locale TEXT,
            email_status TEXT NOT NULL DEFAULT 'ok'
                CHECK (email_status IN ('ok', 'bounced', 'spam_report')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_licenses_email_family
            ON licenses(lower(email), lower(family));
        CREATE INDEX IF NOT EXISTS idx_licenses_family_mac
            ON licenses(lower(family), mac_address);

        CREATE TABLE IF NOT EXISTS entitlements (
            id TEXT PRIMARY KEY,
            license_id TEXT NOT NULL REFERENCES licenses(id) ON DELETE CASCADE,
            product_sku TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN (
                'trial', 'active', 'awaiting_payment',
                'pending_cancellation', 'suspended', 'revoked'
            )),
            origin TEXT NOT NULL,
            expires_at INTEGER,
            trial_expires_at INTEGER,
            platform_subscription_id TEXT,
            billing_event_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (
                (origin = 'trial' AND expires_at IS NULL)
                OR (origin <> 'trial' AND trial_expires_at IS NULL)
            )
        );
        -- Replayed creation events must not double-provision
        CREATE UNIQUE INDEX IF NOT EXISTS idx_entitlements_subscription_sku
            ON entitlements(platform_subscription_id, product_sku)
            WHERE platform_subscription_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_entitlements_license ON entitlements(license_id);

        CREATE TABLE IF NOT EXISTS entitlement_grants (
            id TEXT PRIMARY KEY,
            entitlement_id TEXT NOT NULL REFERENCES entitlements(id) ON DELETE CASCADE,
            grant_source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (entitlement_id, grant_source)
        );

        -- Trial history and abuse counters
        CREATE TABLE IF NOT EXISTS trial_attempts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            mac_address TEXT,
            product_sku TEXT NOT NULL,
            family TEXT NOT NULL,
            outcome TEXT NOT NULL CHECK (outcome IN ('granted', 'denied')),
            reason TEXT,
            attempted_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trial_attempts_family_mac
            ON trial_attempts(lower(family), mac_address);
        CREATE INDEX IF NOT EXISTS idx_trial_attempts_time ON trial_attempts(attempted_at);

        CREATE TABLE IF NOT EXISTS trial_attempt_counters (
            kind TEXT NOT NULL CHECK (kind IN ('email', 'mac')),
            value TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            denied INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER NOT NULL,
            PRIMARY KEY (kind, value)
        );

        -- Billing provider customer cache
        CREATE TABLE IF NOT EXISTS billing_customers (
            customer_id TEXT PRIMARY KEY,
            email TEXT,
            name TEXT,
            phone TEXT,
            locale TEXT,
            updated_at INTEGER NOT NULL
        );

        -- Ledger
        CREATE TABLE IF NOT EXISTS ledger_transactions (
            provider_transaction_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('payment', 'refund')),
            subscription_id TEXT NOT NULL,
            license_id TEXT,
            family TEXT,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_transactions_subscription
            ON ledger_transactions(subscription_id);

        CREATE TABLE IF NOT EXISTS subscription_revenue (
            subscription_id TEXT NOT NULL,
            currency TEXT NOT NULL,
            license_id TEXT,
            gross_minor INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (subscription_id, currency)
        );
        CREATE INDEX IF NOT EXISTS idx_subscription_revenue_license
            ON subscription_revenue(license_id);

        CREATE TABLE IF NOT EXISTS family_monthly_revenue (
            family TEXT NOT NULL,
            month TEXT NOT NULL,
            currency TEXT NOT NULL,
            gross_minor INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (family, month, currency)
        );

        -- Webhook replay protection
        CREATE TABLE IF NOT EXISTS processed_billing_events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            processed_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
