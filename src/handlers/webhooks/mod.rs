mod email_events;
mod stripe;

pub use email_events::*;
pub use stripe::*;

use axum::{Router, routing::post};

use crate::db::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/stripe", post(handle_stripe_webhook))
        .route("/webhook/email-events", post(handle_email_events))
}
