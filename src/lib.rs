pub mod billing;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod payments;
pub mod provisioning;
pub mod util;
pub mod validation;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::db::AppState;

/// Every HTTP route, with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(handlers::public::router())
        .merge(handlers::webhooks::router())
        .merge(handlers::admin::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
