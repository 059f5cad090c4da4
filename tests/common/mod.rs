//! Shared fixtures: a file-backed database, a seeded catalog, a recording
//! notifier and a scripted billing provider.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tempfile::TempDir;

pub use licensor::config::Config;
pub use licensor::db::{AppState, DbPool, create_pool, init_db, queries};
pub use licensor::error::{AppError, Result};
pub use licensor::models::*;
pub use licensor::notify::{EmailVars, Notifier, TriggerEvent};
pub use licensor::payments::{BillingApi, StripeInvoice, StripeSubscription};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_KEY: &str = "admin-test-key";
pub const DAY: i64 = 86_400;

// ============ Notifier doubles ============

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    LicenseKey {
        email: String,
        license_key: String,
        family: String,
    },
    RuleBased {
        trigger: TriggerEvent,
        family: String,
        email: String,
    },
    AdminAlert {
        family: String,
        subject: String,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn triggers(&self) -> Vec<TriggerEvent> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::RuleBased { trigger, .. } => Some(trigger),
                _ => None,
            })
            .collect()
    }

    pub fn license_key_mails(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::LicenseKey { .. }))
            .count()
    }

    pub fn admin_alerts(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::AdminAlert { family, subject } => Some((family, subject)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_license_key(&self, email: &str, license_key: &str, family: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::LicenseKey {
            email: email.to_string(),
            license_key: license_key.to_string(),
            family: family.to_string(),
        });
        Ok(())
    }

    async fn send_rule_based_email(
        &self,
        trigger: TriggerEvent,
        family: &str,
        email: &str,
        _vars: &EmailVars,
    ) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::RuleBased {
            trigger,
            family: family.to_string(),
            email: email.to_string(),
        });
        Ok(())
    }

    async fn send_admin_alert(&self, family: &str, subject: &str, _body: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::AdminAlert {
            family: family.to_string(),
            subject: subject.to_string(),
        });
        Ok(())
    }
}

/// Every delivery fails.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send_license_key(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Err(AppError::Internal("mail server down".into()))
    }

    async fn send_rule_based_email(
        &self,
        _: TriggerEvent,
        _: &str,
        _: &str,
        _: &EmailVars,
    ) -> Result<()> {
        Err(AppError::Internal("mail server down".into()))
    }

    async fn send_admin_alert(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Err(AppError::Internal("mail server down".into()))
    }
}

/// Notifier whose deliveries never complete, like a hung mail webhook.
pub struct StalledNotifier;

#[async_trait]
impl Notifier for StalledNotifier {
    async fn send_license_key(&self, _: &str, _: &str, _: &str) -> Result<()> {
        std::future::pending().await
    }

    async fn send_rule_based_email(
        &self,
        _: TriggerEvent,
        _: &str,
        _: &str,
        _: &EmailVars,
    ) -> Result<()> {
        std::future::pending().await
    }

    async fn send_admin_alert(&self, _: &str, _: &str, _: &str) -> Result<()> {
        std::future::pending().await
    }
}

// ============ Billing provider double ============

#[derive(Default)]
pub struct FakeBillingApi {
    pub customers: Mutex<HashMap<String, BillingCustomer>>,
    pub subscriptions: Mutex<HashMap<String, Value>>,
    pub invoices: Mutex<HashMap<String, Value>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeBillingApi {
    pub fn add_customer(&self, id: &str, email: &str) {
        self.customers.lock().unwrap().insert(
            id.to_string(),
            BillingCustomer {
                customer_id: id.to_string(),
                email: Some(email.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn add_subscription(&self, object: Value) {
        let id = object["id"].as_str().unwrap().to_string();
        self.subscriptions.lock().unwrap().insert(id, object);
    }

    pub fn add_invoice(&self, object: Value) {
        let id = object["id"].as_str().unwrap().to_string();
        self.invoices.lock().unwrap().insert(id, object);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillingApi for FakeBillingApi {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<BillingCustomer> {
        self.calls.lock().unwrap().push(format!("customer:{}", customer_id));
        self.customers
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| AppError::Upstream(format!("no such customer {}", customer_id)))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<StripeSubscription> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("subscription:{}", subscription_id));
        let object = self.subscriptions.lock().unwrap().get(subscription_id).cloned();
        let object = object.ok_or_else(|| AppError::Upstream("no such subscription".into()))?;
        Ok(serde_json::from_value(object)?)
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<StripeInvoice> {
        self.calls.lock().unwrap().push(format!("invoice:{}", invoice_id));
        let object = self.invoices.lock().unwrap().get(invoice_id).cloned();
        let object = object.ok_or_else(|| AppError::Upstream("no such invoice".into()))?;
        Ok(serde_json::from_value(object)?)
    }
}

// ============ App state ============

pub struct TestContext {
    // Keeps the database file alive
    _dir: TempDir,
    pub state: AppState,
    pub notifier: Arc<RecordingNotifier>,
    pub billing: Arc<FakeBillingApi>,
}

pub fn test_config() -> Config {
    Config {
        stripe_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        admin_api_key: Some(ADMIN_KEY.to_string()),
        webhook_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn test_context() -> TestContext {
    test_context_with(test_config())
}

pub fn test_context_with(config: Config) -> TestContext {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("licensor.db");
    let pool = create_pool(path.to_str().unwrap()).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
        seed_catalog(&conn);
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let billing = Arc::new(FakeBillingApi::default());
    let state = AppState {
        db: pool,
        config: Arc::new(config),
        notifier: notifier.clone(),
        billing_api: billing.clone(),
    };

    TestContext {
        _dir: dir,
        state,
        notifier,
        billing,
    }
}

impl TestContext {
    pub fn conn(&self) -> r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager> {
        self.state.db.get().unwrap()
    }

    pub fn license(&self, email: &str, family: &str) -> License {
        queries::find_license(&self.conn(), email, family)
            .unwrap()
            .unwrap_or_else(|| panic!("no license for {} in {}", email, family))
    }

    pub fn entitlements(&self, license_id: &str) -> Vec<Entitlement> {
        queries::list_entitlements_for_license(&self.conn(), license_id).unwrap()
    }

    pub fn entitlement(&self, license_id: &str, sku: &str) -> Entitlement {
        let mut matches = queries::list_entitlements_for_license_sku(&self.conn(), license_id, sku).unwrap();
        assert_eq!(matches.len(), 1, "expected one {} entitlement", sku);
        matches.remove(0)
    }

    pub fn count(&self, table: &str) -> i64 {
        self.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }
}

// ============ Catalog ============

fn family(name: &str, trial_days: Option<i64>) -> ProductFamily {
    ProductFamily {
        name: name.to_string(),
        display_name: name.to_uppercase(),
        trial_duration_days: trial_days,
        support_email: Some(format!("support@{}.example.com", name)),
    }
}

fn product(sku: &str, family: &str, price: &str) -> Product {
    Product {
        sku: sku.to_string(),
        name: sku.to_string(),
        family: family.to_string(),
        stripe_price_id: Some(price.to_string()),
        latest_version: Some("2.0.0".to_string()),
        download_url: Some(format!("https://downloads.example.com/{}", sku)),
    }
}

/// Families `grid` (14-day trial, suite of axis + snap) and `draw` (default trial).
pub fn seed_catalog(conn: &rusqlite::Connection) {
    queries::upsert_family(conn, &family("grid", Some(14))).unwrap();
    queries::upsert_family(conn, &family("draw", None)).unwrap();
    queries::upsert_product(conn, &product("grid-axis", "grid", "price_axis")).unwrap();
    queries::upsert_product(conn, &product("grid-snap", "grid", "price_snap")).unwrap();
    queries::upsert_product(conn, &product("grid-suite", "grid", "price_suite")).unwrap();
    queries::upsert_product(conn, &product("draw-pen", "draw", "price_pen")).unwrap();
    queries::add_suite_component(conn, "grid-suite", "grid-axis").unwrap();
    queries::add_suite_component(conn, "grid-suite", "grid-snap").unwrap();
}

pub fn grid_skus() -> Vec<String> {
    vec![
        "grid-axis".to_string(),
        "grid-snap".to_string(),
        "grid-suite".to_string(),
    ]
}

// ============ Billing events ============

pub fn now() -> i64 {
    licensor::util::now()
}

/// `t=<ts>,v1=<hmac>` over `<ts>.<payload>`.
pub fn sign(payload: &[u8], timestamp: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}

pub fn event(id: &str, event_type: &str, created: i64, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object }
    }))
    .unwrap()
}

pub fn subscription(id: &str, customer: &str, status: &str, prices: &[&str], period_end: i64) -> Value {
    let items: Vec<Value> = prices
        .iter()
        .map(|p| json!({ "price": { "id": p }, "current_period_end": period_end }))
        .collect();
    json!({
        "id": id,
        "customer": customer,
        "status": status,
        "cancel_at_period_end": false,
        "items": { "data": items }
    })
}

pub fn invoice(id: &str, subscription_id: &str, amount: i64, currency: &str, created: i64, period_end: Option<i64>) -> Value {
    let lines = match period_end {
        Some(end) => json!({ "data": [ { "period": { "start": created, "end": end } } ] }),
        None => json!({ "data": [] }),
    };
    json!({
        "id": id,
        "customer": "cus_1",
        "subscription": subscription_id,
        "amount_paid": amount,
        "currency": currency,
        "created": created,
        "lines": lines
    })
}

pub fn credit_note(id: &str, invoice_id: &str, total: i64, currency: &str, created: i64) -> Value {
    json!({
        "id": id,
        "invoice": invoice_id,
        "total": total,
        "currency": currency,
        "created": created
    })
}

/// Deliver a correctly signed event.
pub async fn deliver(ctx: &TestContext, raw: &[u8]) -> (StatusCode, &'static str) {
    let signature = sign(raw, now());
    licensor::billing::process_billing_event(&ctx.state, raw, Some(&signature)).await
}
