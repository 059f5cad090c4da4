use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::ledger;
use crate::models::{DuplicateSubscription, TrialAttempt, TrialAttemptCounter};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl PageQuery {
    fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 500), self.offset.max(0))
    }
}

#[derive(Serialize)]
pub struct TrialAttemptPage {
    pub items: Vec<TrialAttempt>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Serialize)]
pub struct RevenueReport {
    pub gross_minor: serde_json::Map<String, serde_json::Value>,
}

pub async fn license_revenue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RevenueReport>> {
    let conn = state.db.get()?;
    if queries::get_license_by_id(&conn, &id)?.is_none() {
        return Err(AppError::NotFound("License not found".into()));
    }
    let totals = ledger::license_revenue(&conn, &id)?;
    Ok(Json(RevenueReport {
        gross_minor: ledger::totals_by_currency(&totals),
    }))
}

/// Month is `YYYY-MM`.
pub async fn family_month_revenue(
    State(state): State<AppState>,
    Path((family, month)): Path<(String, String)>,
) -> Result<Json<RevenueReport>> {
    let valid_month = month.len() == 7
        && month.as_bytes()[4] == b'-'
        && month
            .chars()
            .enumerate()
            .all(|(i, c)| i == 4 || c.is_ascii_digit());
    if !valid_month {
        return Err(AppError::BadRequest("month must look like YYYY-MM".into()));
    }

    let conn = state.db.get()?;
    let totals = ledger::family_month_revenue(&conn, &family, &month)?;
    Ok(Json(RevenueReport {
        gross_minor: ledger::totals_by_currency(&totals),
    }))
}

pub async fn duplicate_subscriptions(
    State(state): State<AppState>,
) -> Result<Json<Vec<DuplicateSubscription>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_duplicate_subscriptions(&conn)?))
}

pub async fn list_trial_attempts(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TrialAttemptPage>> {
    let (limit, offset) = page.clamped();
    let conn = state.db.get()?;
    let (items, total) = queries::list_trial_attempts(&conn, limit, offset)?;
    Ok(Json(TrialAttemptPage {
        items,
        total,
        limit,
        offset,
    }))
}

/// E-mails and machines with the most trial attempts, denials first.
pub async fn top_trial_counters(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<TrialAttemptCounter>>> {
    let (limit, _) = page.clamped();
    let conn = state.db.get()?;
    Ok(Json(queries::list_top_trial_counters(&conn, limit)?))
}
