//! HR sync orchestrator (spec §4.G): periodic pull of employee/department
//! data, diff against the stored tree, and cascade through the
//! effective-permission resolver for every affected employee.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::models::EmployeeDepartment;
use crate::infrastructure::state::AppState;

use super::errors::ServiceError;
use super::permissions::{PermissionsService, ALL_KINDS};

#[derive(Debug, Deserialize)]
struct RawEmployee {
    employee_number: String,
    username: String,
    department_id: String,
}

#[derive(Debug, Deserialize)]
struct RawDepartment {
    id: String,
    parent_id: Option<String>,
    name: String,
}

pub struct HrSyncService {
    state: Arc<AppState>,
    http: Client,
}

impl HrSyncService {
    pub fn new(state: Arc<AppState>) -> Self {
        let http = Client::builder()
            .timeout(state.config.employee_sync.fetch_timeout())
            .build()
            .expect("reqwest client should build with static configuration");
        Self { state, http }
    }

    /// Runs once at boot only if sync is enabled and the department table is
    /// empty, per spec §4.G.
    pub async fn run_if_empty_at_boot(&self) -> Result<(), ServiceError> {
        if !self.state.config.employee_sync.enabled {
            return Ok(());
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM employee_departments")
            .fetch_one(&self.state.main_pool)
            .await?;
        if count == 0 {
            self.run_sync().await?;
        }
        Ok(())
    }

    /// Runs the full sync pass: fetch, diff, cascade, audit (spec §4.G).
    pub async fn run_sync(&self) -> Result<(), ServiceError> {
        if !self.state.config.employee_sync.enabled {
            return Ok(());
        }

        let employees = self.fetch_employees().await?;
        let departments = self.fetch_departments().await?;
        let paths = build_department_paths(&departments);

        let stored: Vec<EmployeeDepartment> = sqlx::query_as("SELECT * FROM employee_departments")
            .fetch_all(&self.state.main_pool)
            .await?;
        let stored_by_number: HashMap<String, EmployeeDepartment> =
            stored.into_iter().map(|e| (e.employee_number.clone(), e)).collect();

        let permissions = PermissionsService::new(Arc::clone(&self.state));
        let mut seen = HashSet::new();
        let (mut new_count, mut dept_changed, mut username_changed) = (0u64, 0u64, 0u64);

        for emp in &employees {
            seen.insert(emp.employee_number.clone());
            let path = paths.get(&emp.department_id).cloned().unwrap_or_default();

            match stored_by_number.get(&emp.employee_number) {
                None => {
                    sqlx::query(
                        "INSERT INTO employee_departments (employee_number, username, department_path, updated_at)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&emp.employee_number)
                    .bind(&emp.username)
                    .bind(&path)
                    .bind(chrono::Utc::now())
                    .execute(&self.state.main_pool)
                    .await?;
                    new_count += 1;
                    for kind in ALL_KINDS {
                        if let Err(err) = permissions.recompute_and_notify(&emp.employee_number, kind).await {
                            warn!(employee_number = %emp.employee_number, error = ?err, "recompute failed for new employee");
                        }
                    }
                }
                Some(existing) => {
                    if existing.department_path != path {
                        if let Err(err) = permissions.handle_department_changed(&emp.employee_number).await {
                            warn!(employee_number = %emp.employee_number, error = ?err, "department-change cascade failed");
                        }
                        sqlx::query(
                            "UPDATE employee_departments SET username = $1, department_path = $2, updated_at = $3 WHERE employee_number = $4",
                        )
                        .bind(&emp.username)
                        .bind(&path)
                        .bind(chrono::Utc::now())
                        .bind(&emp.employee_number)
                        .execute(&self.state.main_pool)
                        .await?;
                        dept_changed += 1;
                    } else if existing.username != emp.username {
                        sqlx::query(
                            "UPDATE employee_departments SET username = $1, updated_at = $2 WHERE employee_number = $3",
                        )
                        .bind(&emp.username)
                        .bind(chrono::Utc::now())
                        .bind(&emp.employee_number)
                        .execute(&self.state.main_pool)
                        .await?;
                        username_changed += 1;
                    }
                }
            }
        }

        let mut removed = 0u64;
        for employee_number in stored_by_number.keys() {
            if seen.contains(employee_number) {
                continue;
            }
            if let Err(err) = permissions.handle_employee_deleted(employee_number).await {
                warn!(employee_number, error = ?err, "employee-deletion cascade failed");
            }
            sqlx::query("DELETE FROM employee_departments WHERE employee_number = $1")
                .bind(employee_number)
                .execute(&self.state.main_pool)
                .await?;
            removed += 1;
        }

        sqlx::query(
            "INSERT INTO permission_audits (id, event_type, employee_number, detail, created_at)
             VALUES ($1, $2, NULL, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind("employee_sync")
        .bind(json!({
            "new": new_count,
            "department_changed": dept_changed,
            "username_changed": username_changed,
            "removed": removed,
        }))
        .bind(chrono::Utc::now())
        .execute(&self.state.main_pool)
        .await?;

        info!(new_count, dept_changed, username_changed, removed, "HR sync complete");
        Ok(())
    }

    async fn fetch_employees(&self) -> Result<Vec<RawEmployee>, ServiceError> {
        let cfg = &self.state.config.employee_sync;
        let body = self.fetch_raw(&cfg.hr_url).await?;
        crate::infrastructure::crypto::decrypt_feed_json(&body, cfg.hr_key.as_bytes())
            .map_err(|err| ServiceError::UpstreamUnavailable(err.to_string()))
    }

    async fn fetch_departments(&self) -> Result<Vec<RawDepartment>, ServiceError> {
        let cfg = &self.state.config.employee_sync;
        let body = self.fetch_raw(&cfg.dept_url).await?;
        crate::infrastructure::crypto::decrypt_feed_json(&body, cfg.dept_key.as_bytes())
            .map_err(|err| ServiceError::UpstreamUnavailable(err.to_string()))
    }

    async fn fetch_raw(&self, url: &str) -> Result<String, ServiceError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ServiceError::UpstreamUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::UpstreamUnavailable(format!(
                "HR feed returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|err| ServiceError::UpstreamUnavailable(err.to_string()))
    }
}

/// Builds each department id's root-to-leaf name path by walking `parent_id`
/// links (spec §4.G step 2).
fn build_department_paths(departments: &[RawDepartment]) -> HashMap<String, Vec<String>> {
    let by_id: HashMap<&str, &RawDepartment> = departments.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut paths = HashMap::new();

    for dept in departments {
        let mut path = Vec::new();
        let mut current = Some(dept);
        let mut guard = 0;
        while let Some(node) = current {
            path.push(node.name.clone());
            guard += 1;
            if guard > 64 {
                warn!(department_id = %dept.id, "department parent chain too deep or cyclic; truncating");
                break;
            }
            current = node
                .parent_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .and_then(|id| by_id.get(id))
                .copied();
        }
        path.reverse();
        paths.insert(dept.id.clone(), path);
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dept(id: &str, parent: Option<&str>, name: &str) -> RawDepartment {
        RawDepartment {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            name: name.to_string(),
        }
    }

    #[test]
    fn builds_root_to_leaf_paths() {
        let departments = vec![
            dept("1", None, "Root"),
            dept("2", Some("1"), "Engineering"),
            dept("3", Some("2"), "Platform"),
        ];
        let paths = build_department_paths(&departments);
        assert_eq!(paths["3"], vec!["Root", "Engineering", "Platform"]);
        assert_eq!(paths["1"], vec!["Root"]);
    }

    #[test]
    fn breaks_cycles_without_looping_forever() {
        let departments = vec![dept("1", Some("2"), "A"), dept("2", Some("1"), "B")];
        let paths = build_department_paths(&departments);
        assert!(paths["1"].len() <= 65);
    }
}
