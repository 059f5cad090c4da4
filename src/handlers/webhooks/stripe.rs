use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::billing::process_billing_event;
use crate::db::AppState;

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = match headers.get("stripe-signature").map(|v| v.to_str()) {
        Some(Ok(s)) => Some(s),
        Some(Err(_)) => return (StatusCode::FORBIDDEN, "Invalid signature header"),
        None => None,
    };

    process_billing_event(&state, &body, signature).await
}
