//! Typed HTTP client for upstream AI Gateway admin operations (spec §4.D).
//!
//! Every call goes through [`crate::infrastructure::retry::retry`] so
//! transient network failures and 5xx responses get the backoff policy from
//! spec §7; 4xx and body-parse failures are not retried.

use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

use super::config::AiGatewayConfig;
use super::retry::retry;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request timed out: {0}")]
    Timeout(String),
    #[error("gateway returned a server error: {0}")]
    Server(String),
    #[error("gateway rejected the request: {0}")]
    Client(String),
    #[error("could not parse gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Server(_))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    code: String,
    #[allow(dead_code)]
    message: String,
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QuotaData {
    quota: f64,
}

#[derive(Debug, Deserialize)]
struct UsedData {
    used: f64,
}

#[derive(Debug, Deserialize)]
struct StarData {
    star_value: String,
}

#[derive(Debug, Deserialize)]
struct BoolData {
    value: bool,
}

#[derive(Debug, Deserialize)]
struct ModelsData {
    models: Vec<String>,
}

/// Client for the Gateway's admin endpoints. Cheap to clone (wraps a pooled
/// `reqwest::Client`); shared process-wide like the scheduler and signing
/// key (spec §5).
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: String,
    auth_header: String,
    auth_value: String,
}

impl GatewayClient {
    pub fn new(config: &AiGatewayConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("reqwest client should build with static configuration");
        Self {
            http,
            base_url: config.base_url(),
            auth_header: config.auth_header.clone(),
            auth_value: config.auth_value.clone(),
        }
    }

    pub async fn query_quota(&self, user_id: &str) -> Result<f64, GatewayError> {
        let data: QuotaData = self.get(&format!("/quota/{user_id}")).await?;
        Ok(data.quota)
    }

    pub async fn refresh_quota(&self, user_id: &str, value: f64) -> Result<(), GatewayError> {
        self.post_form(&format!("/quota/{user_id}/refresh"), &[("value", value.to_string())])
            .await
    }

    pub async fn delta_quota(&self, user_id: &str, delta: f64) -> Result<(), GatewayError> {
        self.post_form(&format!("/quota/{user_id}/delta"), &[("delta", delta.to_string())])
            .await
    }

    pub async fn query_used(&self, user_id: &str) -> Result<f64, GatewayError> {
        let data: UsedData = self.get(&format!("/quota/{user_id}/used")).await?;
        Ok(data.used)
    }

    pub async fn refresh_used(&self, user_id: &str, value: f64) -> Result<(), GatewayError> {
        self.post_form(
            &format!("/quota/{user_id}/used/refresh"),
            &[("value", value.to_string())],
        )
        .await
    }

    pub async fn delta_used(&self, user_id: &str, delta: f64) -> Result<(), GatewayError> {
        self.post_form(
            &format!("/quota/{user_id}/used/delta"),
            &[("delta", delta.to_string())],
        )
        .await
    }

    pub async fn query_star_projects(&self, employee: &str) -> Result<String, GatewayError> {
        let data: StarData = self.get(&format!("/star/{employee}")).await?;
        Ok(data.star_value)
    }

    pub async fn set_star_projects(&self, employee: &str, csv: &str) -> Result<(), GatewayError> {
        self.post_form(
            &format!("/star/{employee}/set"),
            &[("star_value", csv.to_string())],
        )
        .await
    }

    pub async fn query_star_check(&self, employee: &str) -> Result<bool, GatewayError> {
        let data: BoolData = self.get(&format!("/star-check/{employee}")).await?;
        Ok(data.value)
    }

    pub async fn set_star_check(&self, employee: &str, enabled: bool) -> Result<(), GatewayError> {
        self.post_form(
            &format!("/star-check/{employee}/set"),
            &[("value", enabled.to_string())],
        )
        .await
    }

    pub async fn query_quota_check(&self, employee: &str) -> Result<bool, GatewayError> {
        let data: BoolData = self.get(&format!("/quota-check/{employee}")).await?;
        Ok(data.value)
    }

    pub async fn set_quota_check(&self, employee: &str, enabled: bool) -> Result<(), GatewayError> {
        self.post_form(
            &format!("/quota-check/{employee}/set"),
            &[("value", enabled.to_string())],
        )
        .await
    }

    pub async fn query_user_models(&self, employee: &str) -> Result<Vec<String>, GatewayError> {
        let data: ModelsData = self.get(&format!("/models/{employee}")).await?;
        Ok(data.models)
    }

    pub async fn set_user_permission(
        &self,
        employee: &str,
        models: &[String],
    ) -> Result<(), GatewayError> {
        // repeated `models` keys, matching how `form()`/serde_urlencoded encode a sequence field
        let mut form: Vec<(&str, String)> = vec![("user_id", employee.to_string())];
        form.extend(models.iter().map(|model| ("models", model.clone())));
        self.post_form(&format!("/models/{employee}/set"), &form).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        retry(
            || async {
                let response = self
                    .http
                    .get(&url)
                    .header(&self.auth_header, &self.auth_value)
                    .send()
                    .await
                    .map_err(classify_transport_error)?;
                self.parse_envelope(response).await
            },
            GatewayError::is_transient,
        )
        .await
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<(), GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        retry(
            || async {
                let response = self
                    .http
                    .post(&url)
                    .header(&self.auth_header, &self.auth_value)
                    .form(form)
                    .send()
                    .await
                    .map_err(classify_transport_error)?;
                self.parse_envelope::<serde_json::Value>(response).await?;
                Ok(())
            },
            GatewayError::is_transient,
        )
        .await
    }

    async fn parse_envelope<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Server(status.to_string()));
        }
        if status.is_client_error() {
            return Err(GatewayError::Client(status.to_string()));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))?;
        if !envelope.success {
            return Err(GatewayError::Client(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| GatewayError::Decode("missing data field".into()))
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(err.to_string())
    } else if let Some(status) = err.status() {
        if status == StatusCode::INTERNAL_SERVER_ERROR || status.is_server_error() {
            GatewayError::Server(err.to_string())
        } else {
            GatewayError::Client(err.to_string())
        }
    } else {
        GatewayError::Timeout(err.to_string())
    }
}
