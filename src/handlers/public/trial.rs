use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::db::AppState;
use crate::error::Result;
use crate::provisioning::{self, TrialOutcome, TrialRequest};

/// A refused trial is an expected outcome, reported as 403 with the reason.
pub async fn start_trial(
    State(state): State<AppState>,
    Json(req): Json<TrialRequest>,
) -> Result<Response> {
    let outcome = provisioning::start_trial(&state, req).await?;
    let status = match outcome {
        TrialOutcome::Started { .. } => StatusCode::OK,
        TrialOutcome::Denied { .. } => StatusCode::FORBIDDEN,
    };
    Ok((status, Json(outcome)).into_response())
}
