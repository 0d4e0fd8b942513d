use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::models::{ExecutionRecord, Strategy, StrategyKind};
use crate::infrastructure::auth::AuthenticatedUser;
use crate::infrastructure::state::AppState;
use crate::services::errors::ServiceError;
use crate::services::strategy::{NewStrategy, StrategyPatch, StrategyService};

use super::{envelope, validation_error, ApiError, Envelope};

#[derive(Debug, Deserialize, Validate)]
pub struct NewStrategyRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub title: String,
    pub kind: String,
    #[validate(range(min = 0))]
    pub amount: i64,
    pub model_label: Option<String>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub condition: String,
    pub expiry_days: Option<i32>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_exec_per_user: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StrategyPatchRequest {
    pub title: Option<String>,
    pub kind: Option<String>,
    pub amount: Option<i64>,
    /// Empty string clears the field.
    pub model_label: Option<String>,
    /// Empty string clears the field.
    pub cron_expression: Option<String>,
    pub condition: Option<String>,
    /// Zero or negative clears the field back to "end of month".
    pub expiry_days: Option<i32>,
    pub enabled: Option<bool>,
    pub max_exec_per_user: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}
fn default_page_size() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ExecutionsResponse {
    pub items: Vec<ExecutionRecord>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

fn parse_kind(raw: &str) -> Result<StrategyKind, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::InvalidRequest(format!("unknown strategy kind '{raw}'")))
}

pub async fn create(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<NewStrategyRequest>,
) -> Result<Json<Envelope<Strategy>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let kind = parse_kind(&body.kind)?;
    let svc = Arc::new(StrategyService::new(Arc::clone(&state)));
    let strategy = svc
        .create(NewStrategy {
            name: body.name,
            title: body.title,
            kind,
            amount: body.amount,
            model_label: body.model_label,
            cron_expression: body.cron_expression,
            condition: body.condition,
            expiry_days: body.expiry_days,
            enabled: body.enabled,
            max_exec_per_user: body.max_exec_per_user,
        })
        .await?;
    Ok(envelope(strategy))
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<Vec<Strategy>>>, ApiError> {
    let enabled = match query.status.as_deref() {
        Some("enabled") | Some("true") => Some(true),
        Some("disabled") | Some("false") => Some(false),
        _ => None,
    };
    let svc = StrategyService::new(Arc::clone(&state));
    Ok(envelope(svc.list(enabled).await?))
}

pub async fn get_one(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Envelope<Strategy>>, ApiError> {
    let svc = StrategyService::new(Arc::clone(&state));
    Ok(envelope(svc.get(id).await?))
}

pub async fn update(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<StrategyPatchRequest>,
) -> Result<Json<Envelope<Strategy>>, ApiError> {
    let kind = body.kind.as_deref().map(parse_kind).transpose()?;
    let patch = StrategyPatch {
        title: body.title,
        kind,
        amount: body.amount,
        model_label: body.model_label.map(|s| if s.is_empty() { None } else { Some(s) }),
        cron_expression: body.cron_expression.map(|s| if s.is_empty() { None } else { Some(s) }),
        condition: body.condition,
        expiry_days: body.expiry_days.map(|n| if n <= 0 { None } else { Some(n) }),
        enabled: body.enabled,
        max_exec_per_user: body.max_exec_per_user,
    };
    let svc = Arc::new(StrategyService::new(Arc::clone(&state)));
    Ok(envelope(svc.update(id, patch).await?))
}

pub async fn enable(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Envelope<Strategy>>, ApiError> {
    let svc = Arc::new(StrategyService::new(Arc::clone(&state)));
    Ok(envelope(svc.enable(id).await?))
}

pub async fn disable(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Envelope<Strategy>>, ApiError> {
    let svc = Arc::new(StrategyService::new(Arc::clone(&state)));
    Ok(envelope(svc.disable(id).await?))
}

pub async fn delete(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let svc = Arc::new(StrategyService::new(Arc::clone(&state)));
    svc.delete(id).await?;
    Ok(envelope(()))
}

pub async fn scan(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
) -> Result<Json<Envelope<()>>, ApiError> {
    let svc = StrategyService::new(Arc::clone(&state));
    svc.run_scan().await?;
    Ok(envelope(()))
}

pub async fn executions(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(id): Path<i64>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<Envelope<ExecutionsResponse>>, ApiError> {
    let svc = StrategyService::new(Arc::clone(&state));
    let (items, total) = svc.list_executions(id, query.page, query.page_size).await?;
    Ok(envelope(ExecutionsResponse {
        items,
        total,
        page: query.page.max(1),
        page_size: query.page_size.clamp(1, 200),
    }))
}
