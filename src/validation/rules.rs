//! Request-shape validators used by the `validator::Validate` derives on the
//! REST DTOs. Business-rule checks (sufficient balance, voucher integrity,
//! …) stay in the services; this module only rejects shapes that could
//! never be valid regardless of state.

use validator::ValidationError;

use crate::api::rest::quota::QuotaLineRequest;

pub fn non_empty_models(models: &[String]) -> Result<(), ValidationError> {
    if models.iter().any(|m| m.trim().is_empty()) {
        return Err(ValidationError::new("model_name_empty"));
    }
    Ok(())
}

pub fn non_empty_quota_lines(lines: &[QuotaLineRequest]) -> Result<(), ValidationError> {
    if lines.is_empty() {
        return Err(ValidationError::new("quota_list_empty"));
    }
    if lines.iter().any(|l| l.amount <= 0) {
        return Err(ValidationError::new("quota_amount_not_positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_model_name() {
        assert!(non_empty_models(&["".to_string()]).is_err());
        assert!(non_empty_models(&["gpt-4".to_string()]).is_ok());
    }

    #[test]
    fn rejects_empty_or_non_positive_lines() {
        assert!(non_empty_quota_lines(&[]).is_err());
        assert!(non_empty_quota_lines(&[QuotaLineRequest { amount: 0, expiry_date: chrono::Utc::now() }]).is_err());
        assert!(non_empty_quota_lines(&[QuotaLineRequest { amount: 5, expiry_date: chrono::Utc::now() }]).is_ok());
    }
}
