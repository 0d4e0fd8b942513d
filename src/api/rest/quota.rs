use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::models::QuotaAudit;
use crate::infrastructure::auth::AuthenticatedUser;
use crate::infrastructure::state::AppState;
use crate::services::ledger::{LedgerService, RequestedLine, TransferInStatus, TransferOutResult};

use super::{envelope, validation_error, ApiError, Envelope};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaLineRequest {
    pub amount: i64,
    pub expiry_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TransferOutRequest {
    pub receiver_id: String,
    #[validate(custom(function = "crate::validation::rules::non_empty_quota_lines"))]
    pub quota_list: Vec<QuotaLineRequest>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TransferInRequest {
    #[validate(length(min = 1))]
    pub voucher_code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MergeRequest {
    #[validate(length(min = 1))]
    pub main_user_id: String,
    #[validate(length(min = 1))]
    pub other_user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
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
pub struct QuotaResponse {
    pub gateway_total: f64,
    pub gateway_used: f64,
    pub lines: Vec<QuotaLineRequest>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub items: Vec<QuotaAudit>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Serialize)]
pub struct TransferOutResponse {
    pub voucher_code: String,
    pub receiver_id: String,
    pub lines: Vec<QuotaLineRequest>,
}

#[derive(Debug, Serialize)]
pub struct TransferInLineResponse {
    pub amount: i64,
    pub expiry: DateTime<Utc>,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TransferInResponse {
    pub status: &'static str,
    pub amount: i64,
    pub lines: Vec<TransferInLineResponse>,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub moved: i64,
}

pub async fn get_quota(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<Envelope<QuotaResponse>>, ApiError> {
    let ledger = LedgerService::new(Arc::clone(&state));
    let view = ledger.get_user_quota(&user.id).await?;
    Ok(envelope(QuotaResponse {
        gateway_total: view.gateway_total,
        gateway_used: view.gateway_used,
        lines: view
            .lines
            .into_iter()
            .map(|l| QuotaLineRequest { amount: l.amount, expiry_date: l.expiry })
            .collect(),
    }))
}

pub async fn audit_self(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Envelope<AuditResponse>>, ApiError> {
    audit_for(&state, &user.id, query).await
}

pub async fn audit_for_user(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Path(user_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Envelope<AuditResponse>>, ApiError> {
    audit_for(&state, &user_id, query).await
}

async fn audit_for(
    state: &Arc<AppState>,
    user_id: &str,
    query: AuditQuery,
) -> Result<Json<Envelope<AuditResponse>>, ApiError> {
    let ledger = LedgerService::new(Arc::clone(state));
    let (items, total) = ledger.list_audit(user_id, query.page, query.page_size).await?;
    Ok(envelope(AuditResponse {
        items,
        total,
        page: query.page.max(1),
        page_size: query.page_size.clamp(1, 200),
    }))
}

pub async fn transfer_out(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(body): Json<TransferOutRequest>,
) -> Result<Json<Envelope<TransferOutResponse>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let ledger = LedgerService::new(Arc::clone(&state));
    let giver = ledger.load_auth_profile(&user.id).await?;
    let lines = body
        .quota_list
        .into_iter()
        .map(|l| RequestedLine { amount: l.amount, expiry: l.expiry_date })
        .collect();
    let result: TransferOutResult = ledger.transfer_out(&giver, &body.receiver_id, lines).await?;
    Ok(envelope(TransferOutResponse {
        voucher_code: result.voucher_code,
        receiver_id: result.receiver_id,
        lines: result
            .lines
            .into_iter()
            .map(|l| QuotaLineRequest { amount: l.amount, expiry_date: l.expiry })
            .collect(),
    }))
}

pub async fn transfer_in(
    Extension(state): Extension<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(body): Json<TransferInRequest>,
) -> Result<Json<Envelope<TransferInResponse>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let ledger = LedgerService::new(Arc::clone(&state));
    let receiver = ledger.load_auth_profile(&user.id).await?;
    let result = ledger.transfer_in(&receiver, &body.voucher_code).await?;
    let status = match result.status {
        TransferInStatus::Success => "SUCCESS",
        TransferInStatus::PartialSuccess => "PARTIAL_SUCCESS",
        TransferInStatus::Failed => "FAILED",
        TransferInStatus::AlreadyRedeemed => "ALREADY_REDEEMED",
    };
    Ok(envelope(TransferInResponse {
        status,
        amount: result.amount,
        lines: result
            .lines
            .into_iter()
            .map(|l| TransferInLineResponse {
                amount: l.amount,
                expiry: l.expiry,
                status: match l.outcome {
                    crate::services::ledger::LineOutcome::Success => "SUCCESS",
                    crate::services::ledger::LineOutcome::Expired => "EXPIRED",
                    crate::services::ledger::LineOutcome::Failed => "FAILED",
                },
            })
            .collect(),
    }))
}

pub async fn merge(
    Extension(state): Extension<Arc<AppState>>,
    _user: AuthenticatedUser,
    Json(body): Json<MergeRequest>,
) -> Result<Json<Envelope<MergeResponse>>, ApiError> {
    body.validate().map_err(validation_error)?;
    let ledger = LedgerService::new(Arc::clone(&state));
    let moved = ledger.merge_user_quota(&body.main_user_id, &body.other_user_id).await?;
    Ok(envelope(MergeResponse { moved }))
}
