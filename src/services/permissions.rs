//! Effective-permission resolver (spec §4.F): turns user/department policy
//! rows plus a department hierarchy into a materialized per-employee
//! effective view, pushing deltas to the Gateway only on real changes.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::models::{
    default_payload, payload_is_effective, EffectiveView, PolicyKind, PolicyRow, PolicyTargetKind,
};
use crate::infrastructure::state::AppState;

use super::errors::ServiceError;

pub const ALL_KINDS: [PolicyKind; 3] = [
    PolicyKind::ModelAllowlist,
    PolicyKind::StarCheck,
    PolicyKind::QuotaCheck,
];

pub struct PermissionsService {
    state: Arc<AppState>,
}

impl PermissionsService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn set_user_model_allowlist(
        &self,
        employee_number: &str,
        models: &[String],
    ) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::ModelAllowlist,
            PolicyTargetKind::User,
            employee_number,
            serde_json::json!(models),
        )
        .await?;
        self.recompute_and_notify(employee_number, PolicyKind::ModelAllowlist).await
    }

    pub async fn set_department_model_allowlist(
        &self,
        department_name: &str,
        models: &[String],
    ) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::ModelAllowlist,
            PolicyTargetKind::Department,
            department_name,
            serde_json::json!(models),
        )
        .await?;
        self.cascade_department(department_name, PolicyKind::ModelAllowlist).await
    }

    pub async fn set_user_star_check(&self, employee_number: &str, enabled: bool) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::StarCheck,
            PolicyTargetKind::User,
            employee_number,
            serde_json::json!(enabled),
        )
        .await?;
        self.recompute_and_notify(employee_number, PolicyKind::StarCheck).await
    }

    pub async fn set_department_star_check(&self, department_name: &str, enabled: bool) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::StarCheck,
            PolicyTargetKind::Department,
            department_name,
            serde_json::json!(enabled),
        )
        .await?;
        self.cascade_department(department_name, PolicyKind::StarCheck).await
    }

    pub async fn set_user_quota_check(&self, employee_number: &str, enabled: bool) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::QuotaCheck,
            PolicyTargetKind::User,
            employee_number,
            serde_json::json!(enabled),
        )
        .await?;
        self.recompute_and_notify(employee_number, PolicyKind::QuotaCheck).await
    }

    pub async fn set_department_quota_check(&self, department_name: &str, enabled: bool) -> Result<(), ServiceError> {
        self.upsert_policy(
            PolicyKind::QuotaCheck,
            PolicyTargetKind::Department,
            department_name,
            serde_json::json!(enabled),
        )
        .await?;
        self.cascade_department(department_name, PolicyKind::QuotaCheck).await
    }

    pub async fn get_effective_for_user(
        &self,
        employee_number: &str,
        kind: PolicyKind,
    ) -> Result<serde_json::Value, ServiceError> {
        let stored: Option<EffectiveView> = sqlx::query_as(
            "SELECT * FROM effective_views WHERE employee_number = $1 AND kind = $2",
        )
        .bind(employee_number)
        .bind(kind)
        .fetch_optional(&self.state.main_pool)
        .await?;
        if let Some(view) = stored {
            return Ok(view.payload);
        }
        let path = self.department_path_for_employee(employee_number).await?;
        Ok(self.resolve(Some(employee_number), &path, kind).await?)
    }

    pub async fn get_effective_for_department(
        &self,
        department_name: &str,
        kind: PolicyKind,
    ) -> Result<serde_json::Value, ServiceError> {
        let path = self.department_path_containing(department_name).await?;
        self.resolve(None, &path, kind).await
    }

    /// On employee deletion (spec §4.F): clear user-scoped policies, delete
    /// the effective view, and push a clear if the removed payload mattered.
    pub async fn handle_employee_deleted(&self, employee_number: &str) -> Result<(), ServiceError> {
        for kind in ALL_KINDS {
            let stored: Option<EffectiveView> = sqlx::query_as(
                "SELECT * FROM effective_views WHERE employee_number = $1 AND kind = $2",
            )
            .bind(employee_number)
            .bind(kind)
            .fetch_optional(&self.state.main_pool)
            .await?;

            sqlx::query("DELETE FROM policy_rows WHERE target_kind = $1 AND target_id = $2 AND kind = $3")
                .bind(PolicyTargetKind::User)
                .bind(employee_number)
                .bind(kind)
                .execute(&self.state.main_pool)
                .await?;
            sqlx::query("DELETE FROM effective_views WHERE employee_number = $1 AND kind = $2")
                .bind(employee_number)
                .bind(kind)
                .execute(&self.state.main_pool)
                .await?;

            if let Some(view) = stored {
                if payload_is_effective(kind, &view.payload) {
                    if let Err(err) = self.push_to_gateway(employee_number, kind, &default_payload(kind)).await {
                        warn!(employee_number, kind = ?kind, error = ?err, "best-effort clear push failed on employee deletion");
                    }
                }
            }
        }
        Ok(())
    }

    /// On employee department change (spec §4.F): the personal model
    /// allowlist is department-tied and is cleared first, then every kind
    /// is recomputed against the employee's new path.
    pub async fn handle_department_changed(&self, employee_number: &str) -> Result<(), ServiceError> {
        sqlx::query("DELETE FROM policy_rows WHERE target_kind = $1 AND target_id = $2 AND kind = $3")
            .bind(PolicyTargetKind::User)
            .bind(employee_number)
            .bind(PolicyKind::ModelAllowlist)
            .execute(&self.state.main_pool)
            .await?;

        for kind in ALL_KINDS {
            self.recompute_and_notify(employee_number, kind).await?;
        }
        Ok(())
    }

    async fn cascade_department(&self, department_name: &str, kind: PolicyKind) -> Result<(), ServiceError> {
        let employees: Vec<String> = sqlx::query_scalar(
            "SELECT employee_number FROM employee_departments WHERE $1 = ANY(department_path)",
        )
        .bind(department_name)
        .fetch_all(&self.state.main_pool)
        .await?;

        for employee_number in employees {
            self.recompute_and_notify(&employee_number, kind).await?;
        }
        Ok(())
    }

    /// Recomputes an employee's effective payload for one kind, diffs it
    /// against the stored view, and notifies the Gateway only per the
    /// minimality rule in spec §4.F.
    pub async fn recompute_and_notify(&self, employee_number: &str, kind: PolicyKind) -> Result<(), ServiceError> {
        let path = self.department_path_for_employee(employee_number).await?;
        let new_payload = self.resolve(Some(employee_number), &path, kind).await?;

        let stored: Option<EffectiveView> = sqlx::query_as(
            "SELECT * FROM effective_views WHERE employee_number = $1 AND kind = $2",
        )
        .bind(employee_number)
        .bind(kind)
        .fetch_optional(&self.state.main_pool)
        .await?;

        let should_notify = match &stored {
            Some(existing) => existing.payload != new_payload,
            None => payload_is_effective(kind, &new_payload),
        };

        sqlx::query(
            "INSERT INTO effective_views (employee_number, kind, payload, source_policy_id, updated_at)
             VALUES ($1, $2, $3, NULL, $4)
             ON CONFLICT (employee_number, kind)
             DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(employee_number)
        .bind(kind)
        .bind(&new_payload)
        .bind(Utc::now())
        .execute(&self.state.main_pool)
        .await?;

        if should_notify {
            if let Err(err) = self.push_to_gateway(employee_number, kind, &new_payload).await {
                warn!(employee_number, kind = ?kind, error = ?err, "best-effort permission push failed; next sync retries");
            }
        }
        Ok(())
    }

    async fn push_to_gateway(
        &self,
        employee_number: &str,
        kind: PolicyKind,
        payload: &serde_json::Value,
    ) -> Result<(), crate::infrastructure::gateway::GatewayError> {
        match kind {
            PolicyKind::ModelAllowlist => {
                let models: Vec<String> = payload
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                self.state.gateway.set_user_permission(employee_number, &models).await
            }
            PolicyKind::StarCheck => {
                let enabled = payload.as_bool().unwrap_or(false);
                self.state.gateway.set_star_check(employee_number, enabled).await
            }
            PolicyKind::QuotaCheck => {
                let enabled = payload.as_bool().unwrap_or(false);
                self.state.gateway.set_quota_check(employee_number, enabled).await
            }
        }
    }

    /// Resolution rule (spec §4.F): user override, else leaf-to-root
    /// department scan, else default.
    async fn resolve(
        &self,
        employee_number: Option<&str>,
        department_path: &[String],
        kind: PolicyKind,
    ) -> Result<serde_json::Value, ServiceError> {
        if let Some(employee_number) = employee_number {
            let row: Option<PolicyRow> = sqlx::query_as(
                "SELECT * FROM policy_rows WHERE target_kind = $1 AND target_id = $2 AND kind = $3",
            )
            .bind(PolicyTargetKind::User)
            .bind(employee_number)
            .bind(kind)
            .fetch_optional(&self.state.main_pool)
            .await?;
            if let Some(row) = row {
                if payload_is_effective(kind, &row.payload) {
                    return Ok(row.payload);
                }
            }
        }

        for dept in department_path.iter().rev() {
            let row: Option<PolicyRow> = sqlx::query_as(
                "SELECT * FROM policy_rows WHERE target_kind = $1 AND target_id = $2 AND kind = $3",
            )
            .bind(PolicyTargetKind::Department)
            .bind(dept)
            .bind(kind)
            .fetch_optional(&self.state.main_pool)
            .await?;
            if let Some(row) = row {
                if payload_is_effective(kind, &row.payload) {
                    return Ok(row.payload);
                }
            }
        }

        Ok(default_payload(kind))
    }

    async fn department_path_for_employee(&self, employee_number: &str) -> Result<Vec<String>, ServiceError> {
        let path: Option<Vec<String>> = sqlx::query_scalar(
            "SELECT department_path FROM employee_departments WHERE employee_number = $1",
        )
        .bind(employee_number)
        .fetch_optional(&self.state.main_pool)
        .await?;
        Ok(path.unwrap_or_default())
    }

    /// Finds any employee's path containing `department_name` and trims it
    /// down to that department, root-inclusive — there is no standalone
    /// department tree table, only employee-carried paths.
    async fn department_path_containing(&self, department_name: &str) -> Result<Vec<String>, ServiceError> {
        let candidate: Option<Vec<String>> = sqlx::query_scalar(
            "SELECT department_path FROM employee_departments WHERE $1 = ANY(department_path) LIMIT 1",
        )
        .bind(department_name)
        .fetch_optional(&self.state.main_pool)
        .await?;
        let Some(path) = candidate else {
            return Ok(vec![department_name.to_string()]);
        };
        let cut = path.iter().position(|p| p == department_name).unwrap_or(path.len() - 1);
        Ok(path[..=cut].to_vec())
    }

    async fn upsert_policy(
        &self,
        kind: PolicyKind,
        target_kind: PolicyTargetKind,
        target_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO policy_rows (id, kind, target_kind, target_id, payload, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (kind, target_kind, target_id)
             DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(kind)
        .bind(target_kind)
        .bind(target_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.state.main_pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_kinds_covers_the_three_policy_kinds() {
        assert_eq!(ALL_KINDS.len(), 3);
    }
}
