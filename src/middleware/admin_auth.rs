use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::db::AppState;
use crate::util::extract_bearer_token;

/// Check the bearer token against the configured admin key.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    // No key configured means the admin surface does not exist
    let expected = state
        .config
        .admin_api_key
        .as_deref()
        .ok_or(StatusCode::NOT_FOUND)?;
    let token = extract_bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;

    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("admin request with wrong API key");
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authenticate_admin(&state, request.headers())?;
    Ok(next.run(request).await)
}
