use std::sync::Arc;

use axum::extract::Query;
use axum::{Extension, Json};
use serde::Deserialize;
use validator::Validate;

use crate::domain::models::PolicyKind;
use crate::infrastructure::auth::AuthenticatedUser;
use crate::infrastructure::state::AppState;
use crate::services::errors::ServiceError;
use crate::services::permissions::PermissionsService;

use super::{envelope, validation_error, ApiError, Envelope};

#[derive(Debug, Deserialize, Validate)]
pub struct UserModelAllowlistRequest {
    #[validate(length(min = 1))]
    pub employee_number: String,
    #[validate(custom(function = "crate::validation::rules::non_empty_models"))]
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DepartmentModelAllowlistRequest {
    #[validate(length(min = 1))]
    pub department_name: String,
    #[validate(custom(function = "crate::validation::rules::non_empty_models"))]
    pub models: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UserToggleRequest {
    #[validate(length(min = 1))]
    pub employee_number: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DepartmentToggleRequest {
    #[validate(length(min = 1))]
    pub department_name: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct EffectiveQuery {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_type: String,
    pub target_identifier: String,
}

fn parse_kind(raw: &str) -> Result<PolicyKind, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::InvalidRequest(format!("unknown permission type '{raw}'")))
}

/// Resolves the "identifier ambiguity" open question: when employee sync is
/// enabled, API callers address users by their auth-store `user_id` and we
/// translate to the canonical `employee_number`; when sync is disabled there
/// is no HR identity to translate against, so the identifier passed in *is*
/// the employee number.
async fn resolve_employee_number(state: &Arc<AppState>, identifier: &str) -> Result<String, ApiError> {
    if !state.config.employee_sync.enabled {
        return Ok(identifier.to_string());
    }
    let employee_number: Option<String> =
        sqlx::query_scalar("SELECT employee_number FROM auth_users WHERE id = $1")
            .bind(identifier)
            .fetch_optional(&state.auth_pool)
            .await
            .map_err(ServiceError::from)?;
    Ok(employee_number.filter(|s| !s.is_empty()).ok_or(ServiceError::NotFound)?)
}

pub async fn set_user_model_permissions(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<UserModelAllowlistRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let employee_number = resolve_employee_number(&state, &body.employee_number).await?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_user_model_allowlist(&employee_number, &body.models).await?;
    Ok(envelope(()))
}

pub async fn set_department_model_permissions(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<DepartmentModelAllowlistRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_department_model_allowlist(&body.department_name, &body.models).await?;
    Ok(envelope(()))
}

pub async fn set_user_star_check(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<UserToggleRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let employee_number = resolve_employee_number(&state, &body.employee_number).await?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_user_star_check(&employee_number, body.enabled).await?;
    Ok(envelope(()))
}

pub async fn set_department_star_check(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<DepartmentToggleRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_department_star_check(&body.department_name, body.enabled).await?;
    Ok(envelope(()))
}

pub async fn set_user_quota_check(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<UserToggleRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let employee_number = resolve_employee_number(&state, &body.employee_number).await?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_user_quota_check(&employee_number, body.enabled).await?;
    Ok(envelope(()))
}

pub async fn set_department_quota_check(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<DepartmentToggleRequest>,
) -> Result<Json<Envelope<()>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let svc = PermissionsService::new(Arc::clone(&state));
    svc.set_department_quota_check(&body.department_name, body.enabled).await?;
    Ok(envelope(()))
}

pub async fn get_effective(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Query(query): Query<EffectiveQuery>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    let kind = parse_kind(&query.kind)?;
    let svc = PermissionsService::new(Arc::clone(&state));
    let payload = match query.target_type.as_str() {
        "user" => {
            let employee_number = resolve_employee_number(&state, &query.target_identifier).await?;
            svc.get_effective_for_user(&employee_number, kind).await?
        }
        "department" => svc.get_effective_for_department(&query.target_identifier, kind).await?,
        other => return Err(ServiceError::InvalidRequest(format!("unknown target_type '{other}'")).into()),
    };
    Ok(envelope(payload))
}
