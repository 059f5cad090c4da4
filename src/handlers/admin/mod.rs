mod licenses;
mod reports;

pub use licenses::*;
pub use reports::*;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::db::AppState;
use crate::middleware::admin_auth;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/grants", post(create_grant))
        .route("/admin/grants/{id}", delete(delete_grant))
        .route("/admin/licenses/{id}", get(get_license).delete(delete_license))
        .route("/admin/licenses/{id}/revoke", post(revoke_license))
        .route("/admin/licenses/{id}/unlink-mac", post(unlink_mac))
        .route("/admin/licenses/{id}/revenue", get(license_revenue))
        .route("/admin/entitlements/{id}", delete(delete_entitlement))
        .route("/admin/families/{name}", delete(delete_family))
        .route(
            "/admin/families/{name}/revenue/{month}",
            get(family_month_revenue),
        )
        .route(
            "/admin/reports/duplicate-subscriptions",
            get(duplicate_subscriptions),
        )
        .route("/admin/trial-attempts", get(list_trial_attempts))
        .route("/admin/trial-counters", get(top_trial_counters))
        .route_layer(middleware::from_fn_with_state(state, admin_auth))
}
