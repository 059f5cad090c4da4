//! Read-only catalog lookups and suite expansion.

use std::collections::BTreeSet;

use rusqlite::Connection;

use crate::db::queries;
use crate::error::Result;

pub use queries::{all_skus_for_family, family_for_sku, skus_for_price, suite_components};

/// Requested SKUs plus every component reachable through suite links.
///
/// Suites may nest; each SKU is expanded once, so cycles terminate.
pub fn expand<S: AsRef<str>>(conn: &Connection, requested: &[S]) -> Result<BTreeSet<String>> {
    let mut expanded = BTreeSet::new();
    let mut pending: Vec<String> = requested
        .iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    while let Some(sku) = pending.pop() {
        if !expanded.insert(sku.clone()) {
            continue;
        }
        for component in queries::suite_components(conn, &sku)? {
            if !expanded.contains(&component) {
                pending.push(component);
            }
        }
    }

    Ok(expanded)
}

/// Trial length for a family, falling back to `default_days`.
pub fn trial_duration_days(conn: &Connection, family: &str, default_days: i64) -> Result<i64> {
    let days = queries::get_family(conn, family)?
        .and_then(|f| f.trial_duration_days)
        .filter(|d| *d > 0)
        .unwrap_or(default_days);
    Ok(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::models::{Product, ProductFamily};

    fn catalog() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        queries::upsert_family(
            &conn,
            &ProductFamily {
                name: "grid".into(),
                display_name: "Grid".into(),
                trial_duration_days: Some(14),
                support_email: None,
            },
        )
        .unwrap();
        for sku in ["grid-suite", "grid-pro", "grid-axis", "grid-snap", "grid-lite"] {
            queries::upsert_product(
                &conn,
                &Product {
                    sku: sku.into(),
                    name: sku.into(),
                    family: "grid".into(),
                    stripe_price_id: None,
                    latest_version: None,
                    download_url: None,
                },
            )
            .unwrap();
        }
        // grid-suite -> grid-pro -> {grid-axis, grid-snap}, with a cycle back
        queries::add_suite_component(&conn, "grid-suite", "grid-pro").unwrap();
        queries::add_suite_component(&conn, "grid-pro", "grid-axis").unwrap();
        queries::add_suite_component(&conn, "grid-pro", "grid-snap").unwrap();
        queries::add_suite_component(&conn, "grid-snap", "grid-suite").unwrap();
        conn
    }

    #[test]
    fn nested_suites_expand_transitively() {
        let conn = catalog();
        let skus = expand(&conn, &["grid-suite"]).unwrap();
        let expected: BTreeSet<String> = ["grid-suite", "grid-pro", "grid-axis", "grid-snap"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(skus, expected);
    }

    #[test]
    fn expansion_is_idempotent_and_order_independent() {
        let conn = catalog();
        let once = expand(&conn, &["grid-lite", "grid-pro"]).unwrap();
        let reordered = expand(&conn, &["grid-pro", "grid-lite", "grid-pro"]).unwrap();
        let twice = expand(&conn, &once.iter().collect::<Vec<_>>()).unwrap();
        assert_eq!(once, reordered);
        assert_eq!(once, twice);
    }

    #[test]
    fn plain_skus_expand_to_themselves() {
        let conn = catalog();
        let skus = expand(&conn, &["grid-lite", " "]).unwrap();
        assert_eq!(skus.into_iter().collect::<Vec<_>>(), vec!["grid-lite".to_string()]);
    }

    #[test]
    fn trial_duration_prefers_family_setting() {
        let conn = catalog();
        assert_eq!(trial_duration_days(&conn, "GRID", 7).unwrap(), 14);
        assert_eq!(trial_duration_days(&conn, "other", 7).unwrap(), 7);
    }
}
