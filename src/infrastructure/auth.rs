//! Bearer-token claim extraction (spec.md §6).
//!
//! Token *signature* verification happens upstream of this service (the
//! gateway/ingress that fronts it); the core only trusts the configured
//! header and pulls the `id` claim (and, where the caller needs them,
//! `name`/`phone`/`github`) out of the JWT payload segment. There is no
//! local signing secret for session tokens — only the voucher signing key
//! in [`crate::domain::voucher`] is verified locally.

use std::sync::Arc;

use axum::{
    async_trait, extract::FromRequestParts, http::request::Parts, response::IntoResponse, Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::infrastructure::state::AppState;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,
    #[error("malformed bearer token")]
    Malformed,
    #[error("application state unavailable")]
    MissingState,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::UNAUTHORIZED;
        let message = match self {
            AuthError::Missing => "missing authorization header",
            AuthError::Malformed => "malformed bearer token",
            AuthError::MissingState => "application state unavailable",
        };
        (
            status,
            Json(serde_json::json!({ "success": false, "message": message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    id: String,
    name: Option<String>,
    phone: Option<String>,
    github: Option<String>,
}

/// The caller identity extracted from the bearer token, per spec.md §6.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub github: Option<String>,
}

#[async_trait]
impl FromRequestParts<()> for AuthenticatedUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &()) -> Result<Self, Self::Rejection> {
        let Some(state) = parts.extensions.get::<Arc<AppState>>() else {
            return Err(AuthError::MissingState);
        };

        let header_name = state.config.server.token_header.as_str();
        let Some(header_value) = parts.headers.get(header_name) else {
            return Err(AuthError::Missing);
        };
        let header_str = header_value.to_str().map_err(|_| AuthError::Malformed)?;
        let token = header_str.strip_prefix("Bearer ").unwrap_or(header_str);

        let claims = parse_claims(token).map_err(|err| {
            warn!(error = %err, "failed to parse bearer token claims");
            AuthError::Malformed
        })?;

        Ok(AuthenticatedUser {
            id: claims.id,
            name: claims.name,
            phone: claims.phone,
            github: claims.github,
        })
    }
}

fn parse_claims(token: &str) -> Result<Claims, &'static str> {
    let payload_segment = token
        .split('.')
        .nth(1)
        .ok_or("token has no payload segment")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload_segment)
        .map_err(|_| "payload segment is not valid base64url")?;
    serde_json::from_slice(&bytes).map_err(|_| "payload segment is not a claims object")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload(json: &str) -> String {
        URL_SAFE_NO_PAD.encode(json.as_bytes())
    }

    #[test]
    fn extracts_id_and_optional_claims() {
        let payload = encode_payload(r#"{"id":"u-1","name":"Ada","github":"ada"}"#);
        let token = format!("header.{payload}.signature");
        let claims = parse_claims(&token).unwrap();
        assert_eq!(claims.id, "u-1");
        assert_eq!(claims.name.as_deref(), Some("Ada"));
        assert_eq!(claims.phone, None);
        assert_eq!(claims.github.as_deref(), Some("ada"));
    }

    #[test]
    fn rejects_token_without_payload_segment() {
        assert!(parse_claims("not-a-jwt").is_err());
    }

    #[test]
    fn rejects_non_json_payload() {
        let token = format!("header.{}.sig", encode_payload("not json"));
        assert!(parse_claims(&token).is_err());
    }
}
