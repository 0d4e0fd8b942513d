//! Thin translation layer over the C/E/F/G services (spec §6): HTTP
//! routing, bearer-token extraction, request validation and JSON response
//! shaping all live here — the services themselves know nothing of HTTP.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use crate::services::errors::ServiceError;

pub mod employee_sync;
pub mod health;
pub mod permissions;
pub mod quota;
pub mod strategies;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/v1/strategies", post(strategies::create).get(strategies::list))
        .route("/v1/strategies/scan", post(strategies::scan))
        .route(
            "/v1/strategies/:id",
            get(strategies::get_one).put(strategies::update).delete(strategies::delete),
        )
        .route("/v1/strategies/:id/enable", post(strategies::enable))
        .route("/v1/strategies/:id/disable", post(strategies::disable))
        .route("/v1/strategies/:id/executions", get(strategies::executions))
        .route("/v1/quota", get(quota::get_quota))
        .route("/v1/quota/audit", get(quota::audit_self))
        .route("/v1/quota/audit/:user_id", get(quota::audit_for_user))
        .route("/v1/quota/transfer-out", post(quota::transfer_out))
        .route("/v1/quota/transfer-in", post(quota::transfer_in))
        .route("/v1/quota/merge", post(quota::merge))
        .route(
            "/v1/model-permissions/user",
            post(permissions::set_user_model_permissions),
        )
        .route(
            "/v1/model-permissions/department",
            post(permissions::set_department_model_permissions),
        )
        .route(
            "/v1/star-check-permissions/user",
            post(permissions::set_user_star_check),
        )
        .route(
            "/v1/star-check-permissions/department",
            post(permissions::set_department_star_check),
        )
        .route(
            "/v1/quota-check-permissions/user",
            post(permissions::set_user_quota_check),
        )
        .route(
            "/v1/quota-check-permissions/department",
            post(permissions::set_department_quota_check),
        )
        .route("/v1/effective-permissions", get(permissions::get_effective))
        .route("/v1/employee-sync", post(employee_sync::trigger))
}

/// The `{code, message, success, data}` envelope every endpoint responds
/// with (spec §6).
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: String,
    pub message: String,
    pub success: bool,
    pub data: Option<T>,
}

pub fn envelope<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: "ok".to_string(),
        message: "ok".to_string(),
        success: true,
        data: Some(data),
    })
}

pub fn envelope_empty() -> Json<Envelope<()>> {
    Json(Envelope {
        code: "ok".to_string(),
        message: "ok".to_string(),
        success: true,
        data: None,
    })
}

pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status_code();
        let body = Envelope::<()> {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            success: false,
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

pub fn validation_error(err: validator::ValidationErrors) -> ApiError {
    ApiError(ServiceError::InvalidRequest(err.to_string()))
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"code": "not_found", "message": "no such route", "success": false})),
    )
}
