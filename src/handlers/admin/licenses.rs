use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{Entitlement, EntitlementGrant, License};
use crate::provisioning::{self, AdminGrantRequest, ProvisionOutcome};

#[derive(Serialize)]
pub struct EntitlementWithGrants {
    #[serde(flatten)]
    pub entitlement: Entitlement,
    pub grants: Vec<EntitlementGrant>,
}

#[derive(Serialize)]
pub struct LicenseDetail {
    #[serde(flatten)]
    pub license: License,
    pub entitlements: Vec<EntitlementWithGrants>,
}

pub async fn create_grant(
    State(state): State<AppState>,
    Json(req): Json<AdminGrantRequest>,
) -> Result<(StatusCode, Json<ProvisionOutcome>)> {
    let outcome = provisioning::admin_grant(&state, req).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn get_license(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LicenseDetail>> {
    let conn = state.db.get()?;
    let license = queries::get_license_by_id(&conn, &id)?
        .ok_or_else(|| AppError::NotFound("License not found".into()))?;

    let entitlements = queries::list_entitlements_for_license(&conn, &license.id)?
        .into_iter()
        .map(|entitlement| {
            let grants = queries::list_grants_for_entitlement(&conn, &entitlement.id)?;
            Ok(EntitlementWithGrants { entitlement, grants })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Json(LicenseDetail {
        license,
        entitlements,
    }))
}

pub async fn revoke_license(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let conn = state.db.get()?;
    if queries::get_license_by_id(&conn, &id)?.is_none() {
        return Err(AppError::NotFound("License not found".into()));
    }

    let revoked = queries::revoke_license_entitlements(&conn, &id)?;
    tracing::info!(license_id = %id, revoked, "license revoked by admin");

    Ok(Json(serde_json::json!({ "revoked": revoked })))
}

pub async fn unlink_mac(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let conn = state.db.get()?;
    if !queries::clear_license_mac(&conn, &id)? {
        return Err(AppError::NotFound("License not found".into()));
    }
    tracing::info!(license_id = %id, "MAC binding cleared by admin");

    Ok(Json(serde_json::json!({ "unlinked": true })))
}

pub async fn delete_license(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let conn = state.db.get()?;
    if !queries::delete_license(&conn, &id)? {
        return Err(AppError::NotFound("License not found".into()));
    }
    tracing::info!(license_id = %id, "license deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_entitlement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let conn = state.db.get()?;
    if !queries::delete_entitlement(&conn, &id)? {
        return Err(AppError::NotFound("Entitlement not found".into()));
    }
    tracing::info!(entitlement_id = %id, "entitlement deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_grant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let mut conn = state.db.get()?;
    let entitlement_deleted = match queries::delete_grant(&mut conn, &id)? {
        queries::GrantDeletion::NotFound => {
            return Err(AppError::NotFound("Grant not found".into()));
        }
        queries::GrantDeletion::Deleted => false,
        queries::GrantDeletion::DeletedWithEntitlement => true,
    };
    tracing::info!(grant_id = %id, entitlement_deleted, "grant deleted by admin");

    Ok(Json(serde_json::json!({
        "deleted": true,
        "entitlement_deleted": entitlement_deleted,
    })))
}

pub async fn delete_family(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<queries::FamilyPurge>> {
    let mut conn = state.db.get()?;
    let purge = queries::delete_family_cascade(&mut conn, &name)?
        .ok_or_else(|| AppError::NotFound("Family not found".into()))?;
    tracing::warn!(family = %name, licenses = purge.licenses, "family purged by admin");
    Ok(Json(purge))
}
