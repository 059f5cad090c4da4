//! Revenue ledger: payments, clamped refunds, per-currency and per-month
//! buckets, and replay safety.

mod common;
use common::*;

use licensor::ledger::{self, LedgerEntry, LedgerOutcome};
use licensor::provisioning::{self, ProvisionRequest};

// 2025-01-15 and 2025-02-10, UTC
const JAN: i64 = 1_736_899_200;
const FEB: i64 = 1_739_145_600;

async fn subscribe(ctx: &TestContext, subscription_id: &str) {
    provisioning::provision(
        &ctx.state,
        ProvisionRequest {
            email: "a@x.com".to_string(),
            family: "grid".to_string(),
            skus: vec!["grid-axis".to_string()],
            origin: Origin::Stripe,
            status: EntitlementStatus::Active,
            expires_at: Some(JAN + 30 * DAY),
            trial_expires_at: None,
            contact: LicenseContact::default(),
            platform_subscription_id: Some(subscription_id.to_string()),
            grant_source: format!("stripe_sub:{}", subscription_id),
            billing_event_at: None,
        },
    )
    .await
    .unwrap();
}

fn entry(id: &str, subscription_id: &str, amount: i64, currency: &str, at: i64) -> LedgerEntry {
    LedgerEntry {
        transaction_id: id.to_string(),
        subscription_id: subscription_id.to_string(),
        amount_minor: amount,
        currency: currency.to_string(),
        occurred_at: at,
    }
}

fn totals(list: &[RevenueTotal]) -> Vec<(String, i64)> {
    let mut out: Vec<_> = list.iter().map(|t| (t.currency.clone(), t.gross_minor)).collect();
    out.sort();
    out
}

fn pairs(items: &[(&str, i64)]) -> Vec<(String, i64)> {
    items.iter().map(|(c, v)| (c.to_string(), *v)).collect()
}

#[tokio::test]
async fn test_full_refund_returns_totals_to_zero() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let conn = ctx.conn();

    let paid = ledger::record_payment(&conn, &entry("in_1", "sub_1", 4900, "USD", JAN)).unwrap();
    assert_eq!(paid, LedgerOutcome::Applied { delta_minor: 4900 });
    let refunded = ledger::record_refund(&conn, &entry("cn_1", "sub_1", 4900, "usd", JAN + DAY)).unwrap();
    assert_eq!(refunded, LedgerOutcome::Applied { delta_minor: -4900 });

    assert_eq!(
        totals(&ledger::subscription_revenue(&conn, "sub_1").unwrap()),
        pairs(&[("usd", 0)])
    );
    assert_eq!(
        totals(&ledger::family_month_revenue(&conn, "grid", "2025-01").unwrap()),
        pairs(&[("usd", 0)])
    );
}

#[tokio::test]
async fn test_refund_is_clamped_to_recorded_revenue() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let conn = ctx.conn();

    ledger::record_payment(&conn, &entry("in_1", "sub_1", 1000, "usd", JAN)).unwrap();
    let refunded = ledger::record_refund(&conn, &entry("cn_1", "sub_1", 1500, "usd", JAN)).unwrap();

    assert_eq!(refunded, LedgerOutcome::Applied { delta_minor: -1000 });
    assert_eq!(
        totals(&ledger::subscription_revenue(&conn, "sub_1").unwrap()),
        pairs(&[("usd", 0)])
    );

    // Nothing left to reverse
    let again = ledger::record_refund(&conn, &entry("cn_2", "sub_1", 100, "usd", JAN)).unwrap();
    assert_eq!(again, LedgerOutcome::Applied { delta_minor: 0 });
}

#[tokio::test]
async fn test_currencies_are_tracked_separately() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let conn = ctx.conn();

    ledger::record_payment(&conn, &entry("in_1", "sub_1", 1000, "usd", JAN)).unwrap();
    ledger::record_payment(&conn, &entry("in_2", "sub_1", 500, "brl", JAN)).unwrap();
    ledger::record_refund(&conn, &entry("cn_1", "sub_1", 200, "brl", JAN)).unwrap();

    assert_eq!(
        totals(&ledger::subscription_revenue(&conn, "sub_1").unwrap()),
        pairs(&[("brl", 300), ("usd", 1000)])
    );
}

#[tokio::test]
async fn test_replayed_transactions_apply_once() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let conn = ctx.conn();

    ledger::record_payment(&conn, &entry("in_1", "sub_1", 4900, "usd", JAN)).unwrap();
    let replay = ledger::record_payment(&conn, &entry("in_1", "sub_1", 4900, "usd", JAN)).unwrap();
    assert_eq!(replay, LedgerOutcome::AlreadyRecorded);

    ledger::record_refund(&conn, &entry("cn_1", "sub_1", 900, "usd", JAN)).unwrap();
    let replay = ledger::record_refund(&conn, &entry("cn_1", "sub_1", 900, "usd", JAN)).unwrap();
    assert_eq!(replay, LedgerOutcome::AlreadyRecorded);

    assert_eq!(
        totals(&ledger::subscription_revenue(&conn, "sub_1").unwrap()),
        pairs(&[("usd", 4000)])
    );
}

#[tokio::test]
async fn test_refund_lands_in_its_own_month() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let conn = ctx.conn();

    ledger::record_payment(&conn, &entry("in_1", "sub_1", 4900, "usd", JAN)).unwrap();
    ledger::record_refund(&conn, &entry("cn_1", "sub_1", 4900, "usd", FEB)).unwrap();

    assert_eq!(
        totals(&ledger::family_month_revenue(&conn, "grid", "2025-01").unwrap()),
        pairs(&[("usd", 4900)])
    );
    assert_eq!(
        totals(&ledger::family_month_revenue(&conn, "grid", "2025-02").unwrap()),
        pairs(&[("usd", -4900)])
    );
}

#[tokio::test]
async fn test_license_revenue_spans_subscriptions() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    subscribe(&ctx, "sub_2").await;
    let conn = ctx.conn();

    ledger::record_payment(&conn, &entry("in_1", "sub_1", 4900, "usd", JAN)).unwrap();
    ledger::record_payment(&conn, &entry("in_2", "sub_2", 2900, "usd", FEB)).unwrap();

    let license = ctx.license("a@x.com", "grid");
    let revenue = ledger::license_revenue(&conn, &license.id).unwrap();
    assert_eq!(totals(&revenue), pairs(&[("usd", 7800)]));
    assert_eq!(ledger::totals_by_currency(&revenue)["usd"], 7800);
}

#[tokio::test]
async fn test_unknown_subscription_is_an_upstream_inconsistency() {
    let ctx = test_context();
    let conn = ctx.conn();

    let err = ledger::record_payment(&conn, &entry("in_1", "sub_404", 100, "usd", JAN)).unwrap_err();
    assert!(matches!(err, AppError::UpstreamInconsistency(_)));
    assert_eq!(ctx.count("ledger_transactions"), 0);
}

// ============ Via billing events ============

#[tokio::test]
async fn test_credit_note_resolves_subscription_from_ledger() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    let paid = event(
        "evt_paid",
        "invoice.paid",
        JAN,
        invoice("in_1", "sub_1", 4900, "usd", JAN, Some(JAN + 30 * DAY)),
    );
    deliver(&ctx, &paid).await;

    let refund = event("evt_cn", "credit_note.created", JAN + DAY, credit_note("cn_1", "in_1", 4900, "usd", JAN + DAY));
    assert_eq!(deliver(&ctx, &refund).await.1, "Refund recorded");
    assert!(ctx.billing.calls().is_empty());

    assert_eq!(
        totals(&ledger::subscription_revenue(&ctx.conn(), "sub_1").unwrap()),
        pairs(&[("usd", 0)])
    );
}

#[tokio::test]
async fn test_credit_note_for_unseen_invoice_asks_provider() {
    let ctx = test_context();
    subscribe(&ctx, "sub_1").await;
    {
        let conn = ctx.conn();
        ledger::record_payment(&conn, &entry("in_old", "sub_1", 2000, "usd", JAN)).unwrap();
    }
    ctx.billing
        .add_invoice(invoice("in_unseen", "sub_1", 2000, "usd", JAN, None));

    let refund = event(
        "evt_cn",
        "credit_note.created",
        FEB,
        credit_note("cn_1", "in_unseen", 500, "usd", FEB),
    );
    assert_eq!(deliver(&ctx, &refund).await.1, "Refund recorded");
    assert_eq!(ctx.billing.calls(), vec!["invoice:in_unseen"]);

    assert_eq!(
        totals(&ledger::subscription_revenue(&ctx.conn(), "sub_1").unwrap()),
        pairs(&[("usd", 1500)])
    );
}
