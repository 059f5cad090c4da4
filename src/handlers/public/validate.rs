use axum::{Json, extract::State};

use crate::db::AppState;
use crate::error::Result;
use crate::validation::{self, ValidateRequest, ValidationResult};

pub async fn validate_license(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidationResult>> {
    let result = validation::validate_license(&state, req).await?;
    Ok(Json(result))
}
