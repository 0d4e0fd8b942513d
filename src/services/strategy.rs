//! Declarative recharge scheduler (spec §4.E): periodic strategies register
//! their own cron job at boot/CRUD time; single-kind strategies are swept by
//! a scanner job running at a configured interval.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::dsl::{self, ConditionContext, EvalUser};
use crate::domain::models::{ExecutionRecord, ExecutionStatus, Strategy, StrategyKind};
use crate::infrastructure::state::AppState;

use super::errors::ServiceError;
use super::ledger::LedgerService;

#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub name: String,
    pub title: String,
    pub kind: StrategyKind,
    pub amount: i64,
    pub model_label: Option<String>,
    pub cron_expression: Option<String>,
    pub condition: String,
    pub expiry_days: Option<i32>,
    pub enabled: bool,
    pub max_exec_per_user: i32,
}

/// `Some(Some(v))` sets a nullable field to `v`; `Some(None)` clears it;
/// `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct StrategyPatch {
    pub title: Option<String>,
    pub kind: Option<StrategyKind>,
    pub amount: Option<i64>,
    pub model_label: Option<Option<String>>,
    pub cron_expression: Option<Option<String>>,
    pub condition: Option<String>,
    pub expiry_days: Option<Option<i32>>,
    pub enabled: Option<bool>,
    pub max_exec_per_user: Option<i32>,
}

pub struct StrategyService {
    state: Arc<AppState>,
}

impl StrategyService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Boot-time registration of every enabled periodic strategy, per spec §4.E.
    pub async fn register_enabled_periodic(self: &Arc<Self>) -> Result<(), ServiceError> {
        let strategies: Vec<Strategy> = sqlx::query_as(
            "SELECT * FROM strategies WHERE enabled = true AND kind = $1",
        )
        .bind(StrategyKind::Periodic)
        .fetch_all(&self.state.main_pool)
        .await?;

        for strategy in strategies {
            if let Some(cron) = strategy.cron_expression.clone() {
                self.register_cron(strategy.id, &cron).await?;
            }
        }
        Ok(())
    }

    async fn register_cron(self: &Arc<Self>, strategy_id: i64, cron_expression: &str) -> Result<(), ServiceError> {
        let this = Arc::clone(self);
        let task = Arc::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move {
                if let Err(err) = this.run_periodic(strategy_id).await {
                    error!(strategy_id, error = ?err, "periodic strategy run failed");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });
        let scheduler = self.state.scheduler.read().await;
        scheduler
            .register_strategy(strategy_id, cron_expression, task)
            .await
            .map_err(|err| ServiceError::InvalidRequest(err.to_string()))?;
        Ok(())
    }

    async fn unregister_cron(&self, strategy_id: i64) -> Result<(), ServiceError> {
        let scheduler = self.state.scheduler.read().await;
        scheduler
            .unregister_strategy(strategy_id)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        Ok(())
    }

    /// Cron-fired periodic execution (spec §4.E).
    async fn run_periodic(&self, strategy_id: i64) -> Result<(), ServiceError> {
        let strategy: Option<Strategy> = sqlx::query_as("SELECT * FROM strategies WHERE id = $1")
            .bind(strategy_id)
            .fetch_optional(&self.state.main_pool)
            .await?;
        let Some(strategy) = strategy else {
            warn!(strategy_id, "periodic job fired for a deleted strategy");
            return Ok(());
        };
        if !strategy.enabled {
            return Ok(());
        }
        let users = self.load_all_users().await?;
        self.exec_strategy(&strategy, &users).await
    }

    /// Scanner-fired single execution (spec §4.E).
    pub async fn run_scan(&self) -> Result<(), ServiceError> {
        let strategies: Vec<Strategy> = sqlx::query_as(
            "SELECT * FROM strategies WHERE enabled = true AND kind = $1",
        )
        .bind(StrategyKind::Single)
        .fetch_all(&self.state.main_pool)
        .await?;
        let users = self.load_all_users().await?;
        for strategy in &strategies {
            if let Err(err) = self.exec_strategy(strategy, &users).await {
                error!(strategy = %strategy.name, error = ?err, "single-strategy scan failed");
            }
        }
        Ok(())
    }

    /// ExecStrategy (spec §4.E).
    async fn exec_strategy(&self, strategy: &Strategy, users: &[EvalUser]) -> Result<(), ServiceError> {
        let batch = Utc::now()
            .with_timezone(&self.state.config.server.tz())
            .format("%Y%m%d%H%M%S")
            .to_string();
        let expr = match dsl::parse(&strategy.condition) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(strategy = %strategy.name, error = ?err, "condition failed to parse; skipping all users");
                return Ok(());
            }
        };
        let ctx = ConditionCtx { state: &self.state };

        for user in users {
            if strategy.kind == StrategyKind::Single {
                let completed: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM execution_records WHERE strategy_id = $1 AND user_id = $2 AND status = $3 LIMIT 1",
                )
                .bind(strategy.id)
                .bind(&user.id)
                .bind(ExecutionStatus::Completed)
                .fetch_optional(&self.state.main_pool)
                .await?;
                if completed.is_some() {
                    continue;
                }
                let processing_this_batch: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM execution_records WHERE strategy_id = $1 AND user_id = $2 AND batch = $3 AND status = $4 LIMIT 1",
                )
                .bind(strategy.id)
                .bind(&user.id)
                .bind(&batch)
                .bind(ExecutionStatus::Processing)
                .fetch_optional(&self.state.main_pool)
                .await?;
                if processing_this_batch.is_some() {
                    continue;
                }
            }

            if strategy.max_exec_per_user > 0 {
                let completed_count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM execution_records WHERE strategy_id = $1 AND user_id = $2 AND status = $3",
                )
                .bind(strategy.id)
                .bind(&user.id)
                .bind(ExecutionStatus::Completed)
                .fetch_one(&self.state.main_pool)
                .await?;
                if completed_count >= strategy.max_exec_per_user as i64 {
                    continue;
                }
            }

            if !dsl::evaluate(&expr, user, &ctx).await {
                continue;
            }

            if let Err(err) = self.execute_recharge(strategy, &user.id, &batch).await {
                warn!(strategy = %strategy.name, user_id = %user.id, error = ?err, "recharge execution failed");
            }
        }
        Ok(())
    }

    /// executeRecharge (spec §4.E).
    async fn execute_recharge(&self, strategy: &Strategy, user_id: &str, batch: &str) -> Result<(), ServiceError> {
        let current: Strategy = sqlx::query_as("SELECT * FROM strategies WHERE id = $1")
            .bind(strategy.id)
            .fetch_one(&self.state.main_pool)
            .await?;
        if !current.enabled {
            return Err(ServiceError::Conflict("strategy disabled since scan started".into()));
        }

        let expiry = super::ledger::compute_expiry(current.expiry_days, self.state.config.server.tz());
        let record_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO execution_records (id, strategy_id, user_id, batch, status, expiry, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(record_id)
        .bind(current.id)
        .bind(user_id)
        .bind(batch)
        .bind(ExecutionStatus::Processing)
        .bind(expiry)
        .bind(Utc::now())
        .execute(&self.state.main_pool)
        .await?;

        let ledger = LedgerService::new(Arc::clone(&self.state));
        let result = ledger.add_quota_for_strategy(user_id, current.amount, &current).await;

        let status = if result.is_ok() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        sqlx::query("UPDATE execution_records SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(record_id)
            .execute(&self.state.main_pool)
            .await?;

        result?;
        info!(strategy = %current.name, user_id, "recharge executed");
        Ok(())
    }

    pub async fn create(self: &Arc<Self>, input: NewStrategy) -> Result<Strategy, ServiceError> {
        if input.kind == StrategyKind::Periodic {
            let cron = input
                .cron_expression
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidRequest("periodic strategies require a cron expression".into()))?;
            validate_cron(cron)?;
        }

        let now = Utc::now();
        let row: Strategy = sqlx::query_as(
            "INSERT INTO strategies
                (name, title, kind, amount, model_label, cron_expression, condition, expiry_days, enabled, max_exec_per_user, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
             RETURNING *",
        )
        .bind(&input.name)
        .bind(&input.title)
        .bind(input.kind)
        .bind(input.amount)
        .bind(&input.model_label)
        .bind(&input.cron_expression)
        .bind(&input.condition)
        .bind(input.expiry_days)
        .bind(input.enabled)
        .bind(input.max_exec_per_user)
        .bind(now)
        .fetch_one(&self.state.main_pool)
        .await
        .map_err(|err| map_insert_error(err, &input.name))?;

        if row.enabled && row.kind == StrategyKind::Periodic {
            if let Some(cron) = row.cron_expression.clone() {
                self.register_cron(row.id, &cron).await?;
            }
        }
        Ok(row)
    }

    pub async fn get(&self, id: i64) -> Result<Strategy, ServiceError> {
        sqlx::query_as("SELECT * FROM strategies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.state.main_pool)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    pub async fn list(&self, enabled: Option<bool>) -> Result<Vec<Strategy>, ServiceError> {
        let rows = match enabled {
            Some(flag) => {
                sqlx::query_as("SELECT * FROM strategies WHERE enabled = $1 ORDER BY id")
                    .bind(flag)
                    .fetch_all(&self.state.main_pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM strategies ORDER BY id")
                    .fetch_all(&self.state.main_pool)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn update(self: &Arc<Self>, id: i64, patch: StrategyPatch) -> Result<Strategy, ServiceError> {
        let before = self.get(id).await?;

        let title = patch.title.unwrap_or(before.title.clone());
        let kind = patch.kind.unwrap_or(before.kind);
        let amount = patch.amount.unwrap_or(before.amount);
        let model_label = patch.model_label.unwrap_or(before.model_label.clone());
        let cron_expression = patch.cron_expression.unwrap_or(before.cron_expression.clone());
        let condition = patch.condition.unwrap_or(before.condition.clone());
        let expiry_days = patch.expiry_days.unwrap_or(before.expiry_days);
        let enabled = patch.enabled.unwrap_or(before.enabled);
        let max_exec_per_user = patch.max_exec_per_user.unwrap_or(before.max_exec_per_user);

        if kind == StrategyKind::Periodic {
            let cron = cron_expression
                .as_deref()
                .ok_or_else(|| ServiceError::InvalidRequest("periodic strategies require a cron expression".into()))?;
            validate_cron(cron)?;
        }

        let after: Strategy = sqlx::query_as(
            "UPDATE strategies
             SET title = $1, kind = $2, amount = $3, model_label = $4, cron_expression = $5,
                 condition = $6, expiry_days = $7, enabled = $8, max_exec_per_user = $9, updated_at = $10
             WHERE id = $11
             RETURNING *",
        )
        .bind(&title)
        .bind(kind)
        .bind(amount)
        .bind(&model_label)
        .bind(&cron_expression)
        .bind(&condition)
        .bind(expiry_days)
        .bind(enabled)
        .bind(max_exec_per_user)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.state.main_pool)
        .await?;

        self.reconcile_registration(&before, &after).await?;
        Ok(after)
    }

    async fn reconcile_registration(self: &Arc<Self>, before: &Strategy, after: &Strategy) -> Result<(), ServiceError> {
        let was_registered = before.enabled && before.kind == StrategyKind::Periodic;
        let should_be_registered = after.enabled && after.kind == StrategyKind::Periodic;

        if was_registered && !should_be_registered {
            self.unregister_cron(after.id).await?;
        } else if should_be_registered {
            let cron_changed = before.cron_expression != after.cron_expression;
            if !was_registered || cron_changed {
                if let Some(cron) = after.cron_expression.clone() {
                    self.register_cron(after.id, &cron).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn enable(self: &Arc<Self>, id: i64) -> Result<Strategy, ServiceError> {
        self.update(id, StrategyPatch { enabled: Some(true), ..Default::default() }).await
    }

    pub async fn disable(self: &Arc<Self>, id: i64) -> Result<Strategy, ServiceError> {
        self.update(id, StrategyPatch { enabled: Some(false), ..Default::default() }).await
    }

    pub async fn delete(self: &Arc<Self>, id: i64) -> Result<(), ServiceError> {
        let strategy = self.get(id).await?;
        let mut tx = self.state.main_pool.begin().await?;
        sqlx::query("DELETE FROM execution_records WHERE strategy_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM strategies WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if strategy.enabled && strategy.kind == StrategyKind::Periodic {
            self.unregister_cron(id).await?;
        }
        Ok(())
    }

    pub async fn list_executions(
        &self,
        strategy_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<ExecutionRecord>, i64), ServiceError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);
        let offset = (page - 1) * page_size;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM execution_records WHERE strategy_id = $1")
            .bind(strategy_id)
            .fetch_one(&self.state.main_pool)
            .await?;
        let rows: Vec<ExecutionRecord> = sqlx::query_as(
            "SELECT * FROM execution_records WHERE strategy_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(strategy_id)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.state.main_pool)
        .await?;
        Ok((rows, total))
    }

    async fn load_all_users(&self) -> Result<Vec<EvalUser>, ServiceError> {
        let rows = sqlx::query(
            "SELECT id, registered_at, last_access_at, vip_level, starred_projects, company FROM auth_users",
        )
        .fetch_all(&self.state.auth_pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(EvalUser {
                    id: row.try_get("id")?,
                    registered_at: row.try_get("registered_at")?,
                    last_access_at: row.try_get("last_access_at")?,
                    vip_level: row.try_get("vip_level")?,
                    starred_projects: row.try_get("starred_projects")?,
                    company: row.try_get("company")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(ServiceError::from)
    }
}

fn validate_cron(expr: &str) -> Result<(), ServiceError> {
    cron::Schedule::from_str(expr)
        .map(|_| ())
        .map_err(|err| ServiceError::InvalidRequest(format!("invalid cron expression: {err}")))
}

fn map_insert_error(err: sqlx::Error, name: &str) -> ServiceError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return ServiceError::Conflict(format!("strategy name '{name}' already exists"));
        }
    }
    ServiceError::from(err)
}

struct ConditionCtx<'a> {
    state: &'a Arc<AppState>,
}

#[async_trait::async_trait]
impl<'a> ConditionContext for ConditionCtx<'a> {
    fn timezone(&self) -> chrono_tz::Tz {
        self.state.config.server.tz()
    }

    fn hr_sync_enabled(&self) -> bool {
        self.state.config.employee_sync.enabled
    }

    fn github_star_check_enabled(&self) -> bool {
        self.state.config.github_star_check.enabled
    }

    fn required_repo(&self) -> &str {
        &self.state.config.github_star_check.required_repo
    }

    async fn department_path(&self, user_id: &str) -> Option<Vec<String>> {
        let employee_number: Option<String> = sqlx::query_scalar(
            "SELECT employee_number FROM auth_users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.state.auth_pool)
        .await
        .ok()
        .flatten()?;

        let path: Option<Vec<String>> = sqlx::query_scalar(
            "SELECT department_path FROM employee_departments WHERE employee_number = $1",
        )
        .bind(&employee_number)
        .fetch_optional(&self.state.main_pool)
        .await
        .ok()
        .flatten();
        path
    }

    async fn quota_remaining(&self, user_id: &str, _model_or_star: &str) -> Option<f64> {
        self.state.gateway.query_quota(user_id).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_cron_accepts_seconds_precision_expression() {
        assert!(validate_cron("0 */15 * * * *").is_ok());
    }

    #[test]
    fn validate_cron_rejects_garbage() {
        assert!(validate_cron("not a cron expression").is_err());
    }
}
