use rusqlite::{Connection, OptionalExtension, params, types::Value};

use crate::error::Result;
use crate::models::*;
use crate::util::{gen_id, now};

use super::from_row::{
    CUSTOMER_COLS, ENTITLEMENT_COLS, FAMILY_COLS, GRANT_COLS, LEDGER_TRANSACTION_COLS,
    LICENSE_COLS, PRODUCT_COLS, TRIAL_ATTEMPT_COLS, TRIAL_COUNTER_COLS, query_all, query_one,
};

/// Builder for dynamic UPDATE statements with optional fields.
struct UpdateBuilder {
    table: &'static str,
    id: String,
    fields: Vec<(&'static str, Value)>,
    track_updated_at: bool,
}

impl UpdateBuilder {
    fn new(table: &'static str, id: &str) -> Self {
        Self {
            table,
            id: id.to_string(),
            fields: Vec::new(),
            track_updated_at: false,
        }
    }

    fn with_updated_at(mut self) -> Self {
        self.track_updated_at = true;
        self
    }

    fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    fn set_opt<V: Into<Value>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(column, v),
            None => self,
        }
    }

    /// Set a column to an explicit value, NULL included.
    fn set_nullable<V: Into<Value>>(mut self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.fields.push((column, v.into())),
            None => self.fields.push((column, Value::Null)),
        }
        self
    }

    fn execute(mut self, conn: &Connection) -> Result<bool> {
        if self.fields.is_empty() {
            return Ok(false);
        }
        if self.track_updated_at {
            self.fields.push(("updated_at", now().into()));
        }
        let sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.id.into());
        let sql = format!("UPDATE {} SET {} WHERE id = ?", self.table, sets.join(", "));
        let affected = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected > 0)
    }
}

// ============ Catalog ============

pub fn upsert_family(conn: &Connection, family: &ProductFamily) -> Result<()> {
    conn.execute(
        "INSERT INTO product_families (name, display_name, trial_duration_days, support_email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
            display_name = excluded.display_name,
            trial_duration_days = excluded.trial_duration_days,
            support_email = excluded.support_email",
        params![
            &family.name,
            &family.display_name,
            family.trial_duration_days,
            &family.support_email,
            now()
        ],
    )?;
    Ok(())
}

pub fn upsert_product(conn: &Connection, product: &Product) -> Result<()> {
    conn.execute(
        "INSERT INTO products (sku, name, family, stripe_price_id, latest_version, download_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(sku) DO UPDATE SET
            name = excluded.name,
            family = excluded.family,
            stripe_price_id = excluded.stripe_price_id,
            latest_version = excluded.latest_version,
            download_url = excluded.download_url",
        params![
            &product.sku,
            &product.name,
            &product.family,
            &product.stripe_price_id,
            &product.latest_version,
            &product.download_url,
            now()
        ],
    )?;
    Ok(())
}

pub fn add_suite_component(conn: &Connection, suite_sku: &str, component_sku: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO suite_components (suite_sku, component_sku) VALUES (?1, ?2)",
        params![suite_sku, component_sku],
    )?;
    Ok(())
}

pub fn get_family(conn: &Connection, name: &str) -> Result<Option<ProductFamily>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM product_families WHERE lower(name) = lower(?1)",
            FAMILY_COLS
        ),
        params![name],
    )
}

pub fn get_product(conn: &Connection, sku: &str) -> Result<Option<Product>> {
    query_one(
        conn,
        &format!("SELECT {} FROM products WHERE sku = ?1", PRODUCT_COLS),
        params![sku],
    )
}

pub fn family_for_sku(conn: &Connection, sku: &str) -> Result<Option<String>> {
    let family = conn
        .query_row(
            "SELECT family FROM products WHERE sku = ?1",
            params![sku],
            |row| row.get(0),
        )
        .optional()?;
    Ok(family)
}

pub fn all_skus_for_family(conn: &Connection, family: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT sku FROM products WHERE lower(family) = lower(?1) ORDER BY sku")?;
    let skus = stmt
        .query_map(params![family], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(skus)
}

pub fn suite_components(conn: &Connection, sku: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT component_sku FROM suite_components WHERE suite_sku = ?1 ORDER BY component_sku",
    )?;
    let skus = stmt
        .query_map(params![sku], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(skus)
}

pub fn skus_for_price(conn: &Connection, price_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT sku FROM products WHERE stripe_price_id = ?1 ORDER BY sku")?;
    let skus = stmt
        .query_map(params![price_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(skus)
}

/// Rows removed by a family purge.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct FamilyPurge {
    pub licenses: usize,
    pub trial_attempts: usize,
    pub suite_links: usize,
    pub products: usize,
}

/// Remove a family and everything hanging off it in one transaction.
/// Entitlements and grants go with their licenses via ON DELETE CASCADE.
pub fn delete_family_cascade(conn: &mut Connection, family: &str) -> Result<Option<FamilyPurge>> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let Some(existing) = get_family(&tx, family)? else {
        return Ok(None);
    };

    let suite_links = tx.execute(
        "DELETE FROM suite_components
         WHERE suite_sku IN (SELECT sku FROM products WHERE lower(family) = lower(?1))
            OR component_sku IN (SELECT sku FROM products WHERE lower(family) = lower(?1))",
        params![&existing.name],
    )?;
    let licenses = tx.execute(
        "DELETE FROM licenses WHERE lower(family) = lower(?1)",
        params![&existing.name],
    )?;
    let trial_attempts = tx.execute(
        "DELETE FROM trial_attempts WHERE lower(family) = lower(?1)",
        params![&existing.name],
    )?;
    let products = tx.execute(
        "DELETE FROM products WHERE lower(family) = lower(?1)",
        params![&existing.name],
    )?;
    tx.execute(
        "DELETE FROM product_families WHERE lower(name) = lower(?1)",
        params![&existing.name],
    )?;

    tx.commit()?;
    Ok(Some(FamilyPurge {
        licenses,
        trial_attempts,
        suite_links,
        products,
    }))
}

// ============ Licenses ============

pub fn get_license_by_id(conn: &Connection, id: &str) -> Result<Option<License>> {
    query_one(
        conn,
        &format!("SELECT {} FROM licenses WHERE id = ?1", LICENSE_COLS),
        params![id],
    )
}

pub fn get_license_by_key(conn: &Connection, key: &str) -> Result<Option<License>> {
    query_one(
        conn,
        &format!("SELECT {} FROM licenses WHERE license_key = ?1", LICENSE_COLS),
        params![key],
    )
}

pub fn find_license(conn: &Connection, email: &str, family: &str) -> Result<Option<License>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM licenses WHERE lower(email) = lower(?1) AND lower(family) = lower(?2)",
            LICENSE_COLS
        ),
        params![email, family],
    )
}

pub fn list_licenses_by_email(conn: &Connection, email: &str) -> Result<Vec<License>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM licenses WHERE lower(email) = lower(?1) ORDER BY created_at",
            LICENSE_COLS
        ),
        params![email],
    )
}

pub fn license_key_exists(conn: &Connection, key: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM licenses WHERE license_key = ?1)",
        params![key],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn insert_license(
    conn: &Connection,
    email: &str,
    family: &str,
    license_key: &str,
    contact: &LicenseContact,
) -> Result<License> {
    let id = gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO licenses (id, license_key, email, family, mac_address, stripe_customer_id,
                               phone, locale, email_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'ok', ?9, ?9)",
        params![
            &id,
            license_key,
            email,
            family,
            &contact.mac_address,
            &contact.stripe_customer_id,
            &contact.phone,
            &contact.locale,
            now
        ],
    )?;

    Ok(License {
        id,
        license_key: license_key.to_string(),
        email: email.to_string(),
        family: family.to_string(),
        mac_address: contact.mac_address.clone(),
        stripe_customer_id: contact.stripe_customer_id.clone(),
        phone: contact.phone.clone(),
        locale: contact.locale.clone(),
        email_status: EmailStatus::Ok,
        created_at: now,
        updated_at: now,
    })
}

/// Fill contact fields on an existing license. Phone, locale and MAC are
/// first-write-wins; the customer id always tracks the latest payer.
pub fn backfill_license(
    conn: &Connection,
    id: &str,
    contact: &LicenseContact,
    clear_mac: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE licenses SET
            stripe_customer_id = COALESCE(?2, stripe_customer_id),
            phone = COALESCE(phone, ?3),
            locale = COALESCE(locale, ?4),
            mac_address = CASE WHEN ?6 THEN NULL ELSE COALESCE(mac_address, ?5) END,
            updated_at = ?7
         WHERE id = ?1",
        params![
            id,
            &contact.stripe_customer_id,
            &contact.phone,
            &contact.locale,
            &contact.mac_address,
            clear_mac,
            now()
        ],
    )?;
    Ok(())
}

/// Bind a MAC to a license that has none. Returns false if one was already bound.
pub fn bind_license_mac(conn: &Connection, id: &str, mac: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE licenses SET mac_address = ?2, updated_at = ?3
         WHERE id = ?1 AND mac_address IS NULL",
        params![id, mac, now()],
    )?;
    Ok(affected > 0)
}

pub fn clear_license_mac(conn: &Connection, id: &str) -> Result<bool> {
    UpdateBuilder::new("licenses", id)
        .with_updated_at()
        .set_nullable::<String>("mac_address", None)
        .execute(conn)
}

pub fn set_email_status(conn: &Connection, email: &str, status: EmailStatus) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE licenses SET email_status = ?2, updated_at = ?3 WHERE lower(email) = lower(?1)",
        params![email, status.as_ref(), now()],
    )?;
    Ok(affected)
}

pub fn delete_license(conn: &Connection, id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM licenses WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

// ============ Entitlements ============

/// Fields for a new entitlement row.
#[derive(Debug, Clone)]
pub struct NewEntitlement<'a> {
    pub license_id: &'a str,
    pub product_sku: &'a str,
    pub status: EntitlementStatus,
    pub origin: &'a Origin,
    pub expires_at: Option<i64>,
    pub trial_expires_at: Option<i64>,
    pub platform_subscription_id: Option<&'a str>,
    pub billing_event_at: Option<i64>,
}

pub fn insert_entitlement(conn: &Connection, input: &NewEntitlement<'_>) -> Result<Entitlement> {
    let id = gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO entitlements (id, license_id, product_sku, status, origin, expires_at,
                                   trial_expires_at, platform_subscription_id, billing_event_at,
                                   created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            &id,
            input.license_id,
            input.product_sku,
            input.status.as_ref(),
            input.origin.as_str(),
            input.expires_at,
            input.trial_expires_at,
            input.platform_subscription_id,
            input.billing_event_at,
            now
        ],
    )?;

    Ok(Entitlement {
        id,
        license_id: input.license_id.to_string(),
        product_sku: input.product_sku.to_string(),
        status: input.status,
        origin: input.origin.clone(),
        expires_at: input.expires_at,
        trial_expires_at: input.trial_expires_at,
        platform_subscription_id: input.platform_subscription_id.map(String::from),
        billing_event_at: input.billing_event_at,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_entitlement(conn: &Connection, id: &str) -> Result<Option<Entitlement>> {
    query_one(
        conn,
        &format!("SELECT {} FROM entitlements WHERE id = ?1", ENTITLEMENT_COLS),
        params![id],
    )
}

pub fn find_entitlement_by_subscription(
    conn: &Connection,
    subscription_id: &str,
    sku: &str,
) -> Result<Option<Entitlement>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM entitlements WHERE platform_subscription_id = ?1 AND product_sku = ?2",
            ENTITLEMENT_COLS
        ),
        params![subscription_id, sku],
    )
}

/// An uncorrelated entitlement a repeated grant of the same origin can reuse.
pub fn find_reusable_entitlement(
    conn: &Connection,
    license_id: &str,
    sku: &str,
    origin: &Origin,
) -> Result<Option<Entitlement>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM entitlements
             WHERE license_id = ?1 AND product_sku = ?2 AND origin = ?3
               AND platform_subscription_id IS NULL
             ORDER BY created_at LIMIT 1",
            ENTITLEMENT_COLS
        ),
        params![license_id, sku, origin.as_str()],
    )
}

pub fn list_entitlements_for_license(conn: &Connection, license_id: &str) -> Result<Vec<Entitlement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM entitlements WHERE license_id = ?1 ORDER BY product_sku, created_at",
            ENTITLEMENT_COLS
        ),
        params![license_id],
    )
}

pub fn list_entitlements_for_license_sku(
    conn: &Connection,
    license_id: &str,
    sku: &str,
) -> Result<Vec<Entitlement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM entitlements WHERE license_id = ?1 AND product_sku = ?2
             ORDER BY created_at",
            ENTITLEMENT_COLS
        ),
        params![license_id, sku],
    )
}

pub fn list_entitlements_for_subscription(
    conn: &Connection,
    subscription_id: &str,
) -> Result<Vec<Entitlement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM entitlements WHERE platform_subscription_id = ?1 ORDER BY product_sku",
            ENTITLEMENT_COLS
        ),
        params![subscription_id],
    )
}

/// Overwrite status and expiry of a reused entitlement (last write wins).
pub fn refresh_entitlement(
    conn: &Connection,
    id: &str,
    status: EntitlementStatus,
    expires_at: Option<i64>,
    trial_expires_at: Option<i64>,
) -> Result<bool> {
    UpdateBuilder::new("entitlements", id)
        .with_updated_at()
        .set("status", status.as_ref().to_string())
        .set_nullable("expires_at", expires_at)
        .set_nullable("trial_expires_at", trial_expires_at)
        .execute(conn)
}

/// Apply a billing-driven transition. `expiry_column` is left untouched when
/// `expiry` is None.
pub fn apply_entitlement_transition(
    conn: &Connection,
    id: &str,
    status: EntitlementStatus,
    expiry_column: &'static str,
    expiry: Option<i64>,
    event_at: i64,
) -> Result<bool> {
    UpdateBuilder::new("entitlements", id)
        .with_updated_at()
        .set("status", status.as_ref().to_string())
        .set_opt(expiry_column, expiry)
        .set("billing_event_at", event_at)
        .execute(conn)
}

pub fn revoke_license_entitlements(conn: &Connection, license_id: &str) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE entitlements SET status = 'revoked', updated_at = ?2
         WHERE license_id = ?1 AND status <> 'revoked'",
        params![license_id, now()],
    )?;
    Ok(affected)
}

pub fn delete_entitlement(conn: &Connection, id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM entitlements WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

/// Owning license and family of a subscription, via its entitlements.
pub fn license_for_subscription(
    conn: &Connection,
    subscription_id: &str,
) -> Result<Option<(String, String)>> {
    let owner = conn
        .query_row(
            "SELECT l.id, l.family FROM entitlements e
             JOIN licenses l ON l.id = e.license_id
             WHERE e.platform_subscription_id = ?1
             ORDER BY e.created_at LIMIT 1",
            params![subscription_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(owner)
}

// ============ Grants ============

/// Record why an entitlement exists. Returns false when the same source was
/// already recorded for it.
pub fn insert_grant(conn: &Connection, entitlement_id: &str, grant_source: &str) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO entitlement_grants (id, entitlement_id, grant_source, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![gen_id(), entitlement_id, grant_source, now()],
    )?;
    Ok(affected > 0)
}

pub fn list_grants_for_entitlement(
    conn: &Connection,
    entitlement_id: &str,
) -> Result<Vec<EntitlementGrant>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM entitlement_grants WHERE entitlement_id = ?1 ORDER BY created_at",
            GRANT_COLS
        ),
        params![entitlement_id],
    )
}

/// Outcome of deleting a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDeletion {
    NotFound,
    Deleted,
    /// The grant was the last one, so its entitlement went too
    DeletedWithEntitlement,
}

pub fn delete_grant(conn: &mut Connection, grant_id: &str) -> Result<GrantDeletion> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let grant: Option<EntitlementGrant> = query_one(
        &tx,
        &format!("SELECT {} FROM entitlement_grants WHERE id = ?1", GRANT_COLS),
        params![grant_id],
    )?;
    let Some(grant) = grant else {
        return Ok(GrantDeletion::NotFound);
    };

    tx.execute(
        "DELETE FROM entitlement_grants WHERE id = ?1",
        params![grant_id],
    )?;

    let remaining: i64 = tx.query_row(
        "SELECT COUNT(*) FROM entitlement_grants WHERE entitlement_id = ?1",
        params![&grant.entitlement_id],
        |row| row.get(0),
    )?;

    let outcome = if remaining == 0 {
        tx.execute(
            "DELETE FROM entitlements WHERE id = ?1",
            params![&grant.entitlement_id],
        )?;
        GrantDeletion::DeletedWithEntitlement
    } else {
        GrantDeletion::Deleted
    };

    tx.commit()?;
    Ok(outcome)
}

/// (license, sku) pairs backed by more than one entitlement or grant.
pub fn list_duplicate_subscriptions(conn: &Connection) -> Result<Vec<DuplicateSubscription>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.email, l.family, e.product_sku,
                COUNT(DISTINCT e.id),
                COUNT(g.id),
                GROUP_CONCAT(DISTINCT e.platform_subscription_id)
         FROM entitlements e
         JOIN licenses l ON l.id = e.license_id
         LEFT JOIN entitlement_grants g ON g.entitlement_id = e.id
         GROUP BY l.id, e.product_sku
         HAVING COUNT(DISTINCT e.id) > 1 OR COUNT(g.id) > 1
         ORDER BY l.email, e.product_sku",
    )?;
    let rows = stmt.query_map(params![], |row| {
        let subscriptions: Option<String> = row.get(6)?;
        Ok(DuplicateSubscription {
            license_id: row.get(0)?,
            email: row.get(1)?,
            family: row.get(2)?,
            product_sku: row.get(3)?,
            entitlement_count: row.get(4)?,
            grant_count: row.get(5)?,
            subscription_ids: subscriptions
                .map(|s| s.split(',').map(String::from).collect())
                .unwrap_or_default(),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ============ Trials ============

/// True when a trial entitlement in `family` belongs to a license with this
/// e-mail or MAC, or a granted trial attempt already used this MAC.
pub fn trial_fingerprint_match(
    conn: &Connection,
    email: &str,
    mac_address: Option<&str>,
    family: &str,
) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM entitlements e
            JOIN licenses l ON l.id = e.license_id
            WHERE e.origin = 'trial'
              AND lower(l.family) = lower(?3)
              AND (lower(l.email) = lower(?1) OR (?2 IS NOT NULL AND l.mac_address = ?2))
         ) OR EXISTS(
            SELECT 1 FROM trial_attempts t
            WHERE t.outcome = 'granted'
              AND lower(t.family) = lower(?3)
              AND ?2 IS NOT NULL AND t.mac_address = ?2
         )",
        params![email, mac_address, family],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Append a trial attempt and bump the per-email and per-MAC counters.
pub fn record_trial_attempt(conn: &Connection, attempt: &TrialAttempt) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO trial_attempts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            TRIAL_ATTEMPT_COLS
        ),
        params![
            &attempt.id,
            &attempt.email,
            &attempt.mac_address,
            &attempt.product_sku,
            &attempt.family,
            attempt.outcome.as_ref(),
            &attempt.reason,
            attempt.attempted_at
        ],
    )?;

    let denied = i64::from(attempt.outcome == TrialAttemptOutcome::Denied);
    let mut counters = vec![(CounterKind::Email, attempt.email.to_lowercase())];
    if let Some(mac) = &attempt.mac_address {
        counters.push((CounterKind::Mac, mac.clone()));
    }
    for (kind, value) in counters {
        conn.execute(
            "INSERT INTO trial_attempt_counters (kind, value, attempts, denied, last_attempt_at)
             VALUES (?1, ?2, 1, ?3, ?4)
             ON CONFLICT(kind, value) DO UPDATE SET
                attempts = attempts + 1,
                denied = denied + excluded.denied,
                last_attempt_at = excluded.last_attempt_at",
            params![kind.as_ref(), value, denied, attempt.attempted_at],
        )?;
    }
    Ok(())
}

pub fn list_trial_attempts(conn: &Connection, limit: i64, offset: i64) -> Result<(Vec<TrialAttempt>, i64)> {
    let total: i64 =
        conn.query_row("SELECT COUNT(*) FROM trial_attempts", params![], |row| row.get(0))?;
    let items = query_all(
        conn,
        &format!(
            "SELECT {} FROM trial_attempts ORDER BY attempted_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
            TRIAL_ATTEMPT_COLS
        ),
        params![limit, offset],
    )?;
    Ok((items, total))
}

pub fn get_trial_counter(
    conn: &Connection,
    kind: CounterKind,
    value: &str,
) -> Result<Option<TrialAttemptCounter>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM trial_attempt_counters WHERE kind = ?1 AND value = ?2",
            TRIAL_COUNTER_COLS
        ),
        params![kind.as_ref(), value],
    )
}

/// Credentials with the most denied attempts first.
pub fn list_top_trial_counters(conn: &Connection, limit: i64) -> Result<Vec<TrialAttemptCounter>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM trial_attempt_counters
             ORDER BY denied DESC, attempts DESC, last_attempt_at DESC LIMIT ?1",
            TRIAL_COUNTER_COLS
        ),
        params![limit],
    )
}

// ============ Billing customers ============

pub fn upsert_billing_customer(conn: &Connection, customer: &BillingCustomer) -> Result<()> {
    conn.execute(
        "INSERT INTO billing_customers (customer_id, email, name, phone, locale, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(customer_id) DO UPDATE SET
            email = COALESCE(excluded.email, email),
            name = COALESCE(excluded.name, name),
            phone = COALESCE(excluded.phone, phone),
            locale = COALESCE(excluded.locale, locale),
            updated_at = excluded.updated_at",
        params![
            &customer.customer_id,
            &customer.email,
            &customer.name,
            &customer.phone,
            &customer.locale,
            now()
        ],
    )?;
    Ok(())
}

pub fn get_billing_customer(conn: &Connection, customer_id: &str) -> Result<Option<BillingCustomer>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM billing_customers WHERE customer_id = ?1",
            CUSTOMER_COLS
        ),
        params![customer_id],
    )
}

// ============ Ledger ============

/// Write-once import of a provider transaction. Returns false on replay.
pub fn try_insert_ledger_transaction(conn: &Connection, entry: &LedgerTransaction) -> Result<bool> {
    let affected = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO ledger_transactions ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            LEDGER_TRANSACTION_COLS
        ),
        params![
            &entry.provider_transaction_id,
            entry.kind.as_ref(),
            &entry.subscription_id,
            &entry.license_id,
            &entry.family,
            entry.amount_minor,
            &entry.currency,
            entry.occurred_at,
            entry.recorded_at
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_ledger_transaction(conn: &Connection, id: &str) -> Result<Option<LedgerTransaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM ledger_transactions WHERE provider_transaction_id = ?1",
            LEDGER_TRANSACTION_COLS
        ),
        params![id],
    )
}

pub fn add_subscription_revenue(
    conn: &Connection,
    subscription_id: &str,
    currency: &str,
    license_id: Option<&str>,
    delta_minor: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO subscription_revenue (subscription_id, currency, license_id, gross_minor, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(subscription_id, currency) DO UPDATE SET
            gross_minor = gross_minor + excluded.gross_minor,
            license_id = COALESCE(license_id, excluded.license_id),
            updated_at = excluded.updated_at",
        params![subscription_id, currency, license_id, delta_minor, now()],
    )?;
    Ok(())
}

pub fn add_family_month_revenue(
    conn: &Connection,
    family: &str,
    month: &str,
    currency: &str,
    delta_minor: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO family_monthly_revenue (family, month, currency, gross_minor, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(family, month, currency) DO UPDATE SET
            gross_minor = gross_minor + excluded.gross_minor,
            updated_at = excluded.updated_at",
        params![family, month, currency, delta_minor, now()],
    )?;
    Ok(())
}

pub fn subscription_revenue_in(conn: &Connection, subscription_id: &str, currency: &str) -> Result<i64> {
    let total = conn
        .query_row(
            "SELECT gross_minor FROM subscription_revenue WHERE subscription_id = ?1 AND currency = ?2",
            params![subscription_id, currency],
            |row| row.get(0),
        )
        .optional()?;
    Ok(total.unwrap_or(0))
}

pub fn subscription_revenue(conn: &Connection, subscription_id: &str) -> Result<Vec<RevenueTotal>> {
    query_all(
        conn,
        "SELECT currency, gross_minor FROM subscription_revenue
         WHERE subscription_id = ?1 ORDER BY currency",
        params![subscription_id],
    )
}

pub fn license_revenue(conn: &Connection, license_id: &str) -> Result<Vec<RevenueTotal>> {
    query_all(
        conn,
        "SELECT currency, SUM(gross_minor) FROM subscription_revenue
         WHERE license_id = ?1 GROUP BY currency ORDER BY currency",
        params![license_id],
    )
}

pub fn family_month_revenue(conn: &Connection, family: &str, month: &str) -> Result<Vec<RevenueTotal>> {
    query_all(
        conn,
        "SELECT currency, gross_minor FROM family_monthly_revenue
         WHERE lower(family) = lower(?1) AND month = ?2 ORDER BY currency",
        params![family, month],
    )
}

// ============ Webhook Event Deduplication ============

/// Record a billing event as processed. Returns false if it already was.
pub fn try_record_billing_event(conn: &Connection, event_id: &str, event_type: &str) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO processed_billing_events (event_id, event_type, processed_at)
         VALUES (?1, ?2, ?3)",
        params![event_id, event_type, now()],
    )?;
    Ok(affected > 0)
}

pub fn billing_event_processed(conn: &Connection, event_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM processed_billing_events WHERE event_id = ?1)",
        params![event_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}
