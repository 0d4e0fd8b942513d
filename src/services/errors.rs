use axum::http::StatusCode;
use thiserror::Error;

/// The error kinds named in spec §7. `code()` is the stable string carried
/// in the `{code, message, success, data}` response envelope; `status_code`
/// is the HTTP status it maps to.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("insufficient quota")]
    InsufficientQuota,
    #[error("voucher invalid")]
    VoucherInvalid,
    #[error("voucher already redeemed")]
    VoucherAlreadyRedeemed,
    #[error("voucher not for this recipient")]
    VoucherNotForRecipient,
    #[error("partial success: {0}")]
    Partial(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::InsufficientQuota => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::VoucherInvalid => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::VoucherAlreadyRedeemed => StatusCode::CONFLICT,
            ServiceError::VoucherNotForRecipient => StatusCode::FORBIDDEN,
            ServiceError::Partial(_) => StatusCode::OK,
            ServiceError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Unauthenticated => "unauthenticated",
            ServiceError::NotFound => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InsufficientQuota => "insufficient_quota",
            ServiceError::VoucherInvalid => "voucher_invalid",
            ServiceError::VoucherAlreadyRedeemed => "voucher_already_redeemed",
            ServiceError::VoucherNotForRecipient => "voucher_not_for_recipient",
            ServiceError::Partial(_) => "partial",
            ServiceError::UpstreamUnavailable(_) => "upstream_unavailable",
            ServiceError::Transient(_) => "transient",
            ServiceError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<crate::infrastructure::gateway::GatewayError> for ServiceError {
    fn from(err: crate::infrastructure::gateway::GatewayError) -> Self {
        use crate::infrastructure::gateway::GatewayError::*;
        match err {
            Timeout(_) | Server(_) => ServiceError::UpstreamUnavailable(err.to_string()),
            Client(_) | Decode(_) => ServiceError::Internal(err.to_string()),
        }
    }
}

impl From<crate::domain::voucher::VoucherError> for ServiceError {
    fn from(_err: crate::domain::voucher::VoucherError) -> Self {
        ServiceError::VoucherInvalid
    }
}
