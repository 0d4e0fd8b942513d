//! Per-user credit ledger kept in transactional agreement with the Gateway
//! (spec.md §4.C). Every mutating operation brackets its reads and writes in
//! one DB transaction with the Gateway call as the last step before commit,
//! per spec.md §5's concurrency discipline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::models::{AuditOperation, AuthUserProfile, QuotaAudit, QuotaRow, QuotaStatus, Strategy};
use crate::domain::voucher::{self, VoucherLine, VoucherPayload};
use crate::infrastructure::state::AppState;

use super::errors::ServiceError;

/// One (amount, expiry) line in a user-facing quota view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLine {
    pub amount: i64,
    pub expiry: DateTime<Utc>,
}

/// Result of [`LedgerService::get_user_quota`].
#[derive(Debug, Clone)]
pub struct UserQuotaView {
    pub gateway_total: f64,
    pub gateway_used: f64,
    pub lines: Vec<QuotaLine>,
}

/// A single requested transfer-out line.
#[derive(Debug, Clone)]
pub struct RequestedLine {
    pub amount: i64,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransferOutResult {
    pub voucher_code: String,
    pub receiver_id: String,
    pub lines: Vec<RequestedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferInStatus {
    Success,
    PartialSuccess,
    Failed,
    AlreadyRedeemed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Success,
    Expired,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransferInLineDetail {
    pub amount: i64,
    pub expiry: DateTime<Utc>,
    pub outcome: LineOutcome,
}

#[derive(Debug, Clone)]
pub struct TransferInResult {
    pub status: TransferInStatus,
    pub amount: i64,
    pub lines: Vec<TransferInLineDetail>,
}

pub struct LedgerService {
    state: Arc<AppState>,
}

impl LedgerService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// spec.md §4.C `GetUserQuota`.
    pub async fn get_user_quota(&self, user_id: &str) -> Result<UserQuotaView, ServiceError> {
        let gateway_total = self.state.gateway.query_quota(user_id).await?;
        let gateway_used = self.state.gateway.query_used(user_id).await?;
        let rows = self.load_valid_rows(user_id, &self.state.main_pool).await?;
        let lines = consume_earliest_first(&rows, amount_from_f64(gateway_used));
        Ok(UserQuotaView {
            gateway_total,
            gateway_used,
            lines,
        })
    }

    /// spec.md §4.C `AddQuotaForStrategy`.
    pub async fn add_quota_for_strategy(
        &self,
        user_id: &str,
        amount: i64,
        strategy: &Strategy,
    ) -> Result<(), ServiceError> {
        let expiry = compute_expiry(strategy.expiry_days, self.state.config.server.tz());

        let mut tx = self.state.main_pool.begin().await?;
        upsert_valid_row(&mut tx, user_id, amount, expiry).await?;
        insert_audit(
            &mut tx,
            user_id,
            amount,
            AuditOperation::Recharge,
            None,
            None,
            Some(&strategy.name),
            Some(expiry),
            json!({"strategy": strategy.name, "amount": amount, "expiry": expiry}),
        )
        .await?;

        self.state
            .gateway
            .delta_quota(user_id, amount_to_f64(amount))
            .await?;

        tx.commit().await?;
        info!(user_id, amount, strategy = %strategy.name, "recharged user quota");
        Ok(())
    }

    /// spec.md §4.C `TransferOut`.
    pub async fn transfer_out(
        &self,
        giver: &AuthUserProfile,
        receiver_id: &str,
        lines: Vec<RequestedLine>,
    ) -> Result<TransferOutResult, ServiceError> {
        let receiver_id = receiver_id.trim();
        if receiver_id.is_empty() {
            return Err(ServiceError::InvalidRequest("receiver_id is required".into()));
        }
        if lines.is_empty() {
            return Err(ServiceError::InvalidRequest("at least one line is required".into()));
        }

        let available = self.available_by_expiry(&giver.id).await?;
        for line in &lines {
            let have = available.get(&line.expiry).copied().unwrap_or(0);
            if have < line.amount {
                return Err(ServiceError::InsufficientQuota);
            }
        }

        let total: i64 = lines.iter().map(|l| l.amount).sum();
        let earliest = lines.iter().map(|l| l.expiry).min();

        let mut tx = self.state.main_pool.begin().await?;
        for line in &lines {
            decrement_valid_row(&mut tx, &giver.id, line.expiry, line.amount).await?;
        }

        let voucher_lines: Vec<VoucherLine> = lines
            .iter()
            .map(|l| VoucherLine {
                amount: l.amount,
                expiry: l.expiry.timestamp(),
            })
            .collect();
        let payload = VoucherPayload {
            giver_id: giver.id.clone(),
            giver_name: giver.name.clone(),
            giver_phone: giver.phone.clone(),
            giver_github: giver.github_id.clone(),
            giver_starred_projects: giver.starred_projects.clone(),
            receiver_id: receiver_id.to_string(),
            lines: voucher_lines,
            issued_at: Utc::now().timestamp(),
        };
        let voucher_code = voucher::encode(&payload, &self.state.voucher_signing_key)?;

        insert_audit(
            &mut tx,
            &giver.id,
            -total,
            AuditOperation::TransferOut,
            Some(&voucher_code),
            Some(receiver_id),
            None,
            earliest,
            json!({
                "receiver_id": receiver_id,
                "lines": lines.iter().map(|l| json!({"amount": l.amount, "expiry": l.expiry})).collect::<Vec<_>>(),
            }),
        )
        .await?;

        self.state
            .gateway
            .delta_quota(&giver.id, -amount_to_f64(total))
            .await?;

        tx.commit().await?;
        info!(giver = %giver.id, receiver_id, total, "issued transfer-out voucher");

        Ok(TransferOutResult {
            voucher_code,
            receiver_id: receiver_id.to_string(),
            lines,
        })
    }

    /// spec.md §4.C `TransferIn`.
    pub async fn transfer_in(
        &self,
        receiver: &AuthUserProfile,
        voucher_code: &str,
    ) -> Result<TransferInResult, ServiceError> {
        let payload = voucher::decode(voucher_code, &self.state.voucher_signing_key)?;
        if payload.receiver_id != receiver.id {
            return Err(ServiceError::VoucherNotForRecipient);
        }

        let mut tx = self.state.main_pool.begin().await?;

        let insert_result = sqlx::query(
            "INSERT INTO voucher_redemptions (voucher_code, receiver_id, created_at) VALUES ($1, $2, $3)",
        )
        .bind(voucher_code)
        .bind(&receiver.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        if let Err(err) = insert_result {
            if is_unique_violation(&err) {
                return Ok(TransferInResult {
                    status: TransferInStatus::AlreadyRedeemed,
                    amount: 0,
                    lines: Vec::new(),
                });
            }
            return Err(err.into());
        }

        let now = Utc::now();
        let mut lines = Vec::with_capacity(payload.lines.len());
        let mut transferred_total: i64 = 0;
        let mut earliest_success: Option<DateTime<Utc>> = None;

        for line in &payload.lines {
            let expiry = line.expiry_at();
            if expiry <= now {
                lines.push(TransferInLineDetail {
                    amount: line.amount,
                    expiry,
                    outcome: LineOutcome::Expired,
                });
                continue;
            }
            match upsert_valid_row(&mut tx, &receiver.id, line.amount, expiry).await {
                Ok(()) => {
                    transferred_total += line.amount;
                    earliest_success = Some(match earliest_success {
                        Some(current) if current <= expiry => current,
                        _ => expiry,
                    });
                    lines.push(TransferInLineDetail {
                        amount: line.amount,
                        expiry,
                        outcome: LineOutcome::Success,
                    });
                }
                Err(err) => {
                    warn!(error = ?err, receiver = %receiver.id, "transfer-in line failed to persist");
                    lines.push(TransferInLineDetail {
                        amount: line.amount,
                        expiry,
                        outcome: LineOutcome::Failed,
                    });
                }
            }
        }

        let success_count = lines.iter().filter(|l| l.outcome == LineOutcome::Success).count();
        if success_count > 0 {
            insert_audit(
                &mut tx,
                &receiver.id,
                transferred_total,
                AuditOperation::TransferIn,
                Some(voucher_code),
                Some(&payload.giver_id),
                None,
                earliest_success,
                json!({
                    "lines": lines.iter().map(|l| json!({
                        "amount": l.amount,
                        "expiry": l.expiry,
                        "status": match l.outcome { LineOutcome::Success => "SUCCESS", LineOutcome::Expired => "EXPIRED", LineOutcome::Failed => "FAILED" },
                    })).collect::<Vec<_>>(),
                }),
            )
            .await?;
        }

        if transferred_total > 0 {
            self.state
                .gateway
                .delta_quota(&receiver.id, amount_to_f64(transferred_total))
                .await?;
        }

        tx.commit().await?;

        if !payload.giver_starred_projects.trim().is_empty() {
            if let Err(err) = self
                .state
                .gateway
                .set_star_projects(&receiver.id, &payload.giver_starred_projects)
                .await
            {
                warn!(error = ?err, receiver = %receiver.id, "best-effort star-projects push failed");
            }
        }

        let status = if success_count == 0 {
            TransferInStatus::Failed
        } else if success_count == lines.len() {
            TransferInStatus::Success
        } else {
            TransferInStatus::PartialSuccess
        };

        info!(receiver = %receiver.id, amount = transferred_total, status = ?status, "redeemed voucher");

        Ok(TransferInResult {
            status,
            amount: transferred_total,
            lines,
        })
    }

    /// spec.md §4.C `DeductQuota`.
    pub async fn deduct_quota(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), ServiceError> {
        if amount <= 0 {
            return Err(ServiceError::InvalidRequest("amount must be positive".into()));
        }

        let gateway_used = self.state.gateway.query_used(user_id).await?;
        let mut tx = self.state.main_pool.begin().await?;
        let rows = self.load_valid_rows(user_id, &mut *tx).await?;
        let sum: i64 = rows.iter().map(|r| r.amount).sum();
        if sum - amount_from_f64(gateway_used) < amount {
            return Err(ServiceError::InsufficientQuota);
        }

        let mut remaining = amount;
        for row in rows {
            if remaining <= 0 {
                break;
            }
            if row.amount <= remaining {
                remaining -= row.amount;
                delete_row(&mut tx, row.id).await?;
            } else {
                update_row_amount(&mut tx, row.id, row.amount - remaining).await?;
                remaining = 0;
            }
        }

        insert_audit(
            &mut tx,
            user_id,
            -amount,
            AuditOperation::Deduct,
            None,
            reference,
            None,
            None,
            json!({"reason": reason, "model": model}),
        )
        .await?;

        tx.commit().await?;

        if let Err(err) = self
            .state
            .gateway
            .delta_quota(user_id, -amount_to_f64(amount))
            .await
        {
            warn!(error = ?err, user_id, amount, "best-effort gateway deduct push failed, healer will reconcile");
        }

        Ok(())
    }

    /// spec.md §4.C `MergeQuotaRecords`.
    pub async fn merge_quota_records(&self) -> Result<(), ServiceError> {
        let groups = sqlx::query(
            "SELECT user_id, expiry, status FROM quota_rows GROUP BY user_id, expiry, status HAVING COUNT(*) > 1",
        )
        .fetch_all(&self.state.main_pool)
        .await?;

        for group in groups {
            let user_id: String = group.try_get("user_id")?;
            let expiry: DateTime<Utc> = group.try_get("expiry")?;
            let status: QuotaStatus = group.try_get("status")?;

            let mut tx = self.state.main_pool.begin().await?;
            let rows: Vec<QuotaRow> = sqlx::query_as(
                "SELECT * FROM quota_rows WHERE user_id = $1 AND expiry = $2 AND status = $3",
            )
            .bind(&user_id)
            .bind(expiry)
            .bind(status)
            .fetch_all(&mut *tx)
            .await?;

            let summed: i64 = rows.iter().map(|r| r.amount).sum();
            sqlx::query("DELETE FROM quota_rows WHERE user_id = $1 AND expiry = $2 AND status = $3")
                .bind(&user_id)
                .bind(expiry)
                .bind(status)
                .execute(&mut *tx)
                .await?;

            if summed > 0 {
                sqlx::query(
                    "INSERT INTO quota_rows (id, user_id, amount, expiry, status) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(Uuid::new_v4())
                .bind(&user_id)
                .bind(summed)
                .bind(expiry)
                .bind(status)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    /// spec.md §4.C `MergeUserQuota`.
    pub async fn merge_user_quota(&self, main_user: &str, other_user: &str) -> Result<i64, ServiceError> {
        if main_user == other_user {
            return Err(ServiceError::InvalidRequest(
                "main_user_id and other_user_id must differ".into(),
            ));
        }

        let other_rows: Vec<QuotaRow> = sqlx::query_as(
            "SELECT * FROM quota_rows WHERE user_id = $1 AND status = $2 AND amount > 0 ORDER BY expiry ASC",
        )
        .bind(other_user)
        .bind(QuotaStatus::Valid)
        .fetch_all(&self.state.main_pool)
        .await?;

        let mut moved = 0i64;
        let mut tx = self.state.main_pool.begin().await?;
        for row in other_rows {
            let existing: Option<QuotaRow> = sqlx::query_as(
                "SELECT * FROM quota_rows WHERE user_id = $1 AND expiry = $2 AND status = $3",
            )
            .bind(main_user)
            .bind(row.expiry)
            .bind(row.status)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(main_row) => {
                    update_row_amount(&mut tx, main_row.id, main_row.amount + row.amount).await?;
                    delete_row(&mut tx, row.id).await?;
                }
                None => {
                    sqlx::query("UPDATE quota_rows SET user_id = $1 WHERE id = $2")
                        .bind(main_user)
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            moved += row.amount;
        }

        insert_audit(
            &mut tx,
            main_user,
            moved,
            AuditOperation::MergeQuota,
            None,
            Some(other_user),
            None,
            None,
            json!({"other_user_id": other_user, "moved": moved}),
        )
        .await?;

        tx.commit().await?;
        info!(main_user, other_user, moved, "merged user quota");
        Ok(moved)
    }

    /// spec.md §4.C `ExpireQuotas`.
    pub async fn expire_quotas(&self) -> Result<(), ServiceError> {
        let users: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM quota_rows WHERE status = $1",
        )
        .bind(QuotaStatus::Valid)
        .fetch_all(&self.state.main_pool)
        .await?;

        let last_month = (Utc::now().with_timezone(&self.state.config.server.tz()) - chrono::Duration::days(1))
            .format("%Y-%m")
            .to_string();
        for user_id in &users {
            match self.state.gateway.query_used(user_id).await {
                Ok(used) if used > 0.0 => {
                    if let Err(err) = upsert_monthly_usage(&self.state.main_pool, user_id, &last_month, amount_from_f64(used)).await {
                        warn!(error = ?err, user_id, "failed to snapshot monthly usage");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = ?err, user_id, "failed to read gateway used for monthly snapshot"),
            }
        }

        let now = Utc::now();
        let expired_rows: Vec<QuotaRow> = sqlx::query_as(
            "SELECT * FROM quota_rows WHERE status = $1 AND expiry < $2",
        )
        .bind(QuotaStatus::Valid)
        .bind(now)
        .fetch_all(&self.state.main_pool)
        .await?;

        if expired_rows.is_empty() {
            return Ok(());
        }

        let mut by_user: HashMap<String, i64> = HashMap::new();
        for row in &expired_rows {
            *by_user.entry(row.user_id.clone()).or_insert(0) += row.amount;
        }

        let mut tx = self.state.main_pool.begin().await?;
        sqlx::query("UPDATE quota_rows SET status = $1 WHERE status = $2 AND expiry < $3")
            .bind(QuotaStatus::Expired)
            .bind(QuotaStatus::Valid)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for (user_id, expired_amount) in &by_user {
            insert_audit(
                &mut tx,
                user_id,
                -expired_amount,
                AuditOperation::Expire,
                None,
                None,
                None,
                None,
                json!({"expired_amount": expired_amount}),
            )
            .await?;
        }
        tx.commit().await?;

        for (user_id, _) in by_user {
            let remaining_valid_sum: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
            )
            .bind(&user_id)
            .bind(QuotaStatus::Valid)
            .fetch_one(&self.state.main_pool)
            .await
            .unwrap_or(0);

            if let Ok(used) = self.state.gateway.query_used(&user_id).await {
                if used > 0.0 {
                    if let Err(err) = self.state.gateway.delta_used(&user_id, -used).await {
                        warn!(error = ?err, user_id, "failed to reset gateway used during expiry");
                    }
                }
            }

            // Documented-but-unused legacy formula: clamp new_total at
            // `min(remaining_valid_sum, gateway_total - gateway_used)`. The
            // healer pattern below (absolute refresh to ledger truth) is the
            // one actually wired in, per the resolved open question.
            if let Err(err) = self
                .state
                .gateway
                .refresh_quota(&user_id, amount_to_f64(remaining_valid_sum))
                .await
            {
                warn!(error = ?err, user_id, "failed to refresh gateway total during expiry");
            }
        }

        Ok(())
    }

    /// spec.md §4.C `SyncQuotasWithAiGateway` (periodic healer).
    pub async fn sync_quotas_with_ai_gateway(&self) -> Result<(), ServiceError> {
        let users: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM quota_rows WHERE status = $1",
        )
        .bind(QuotaStatus::Valid)
        .fetch_all(&self.state.main_pool)
        .await?;

        for user_id in users {
            let ledger_sum: i64 = sqlx::query_scalar(
                "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
            )
            .bind(&user_id)
            .bind(QuotaStatus::Valid)
            .fetch_one(&self.state.main_pool)
            .await
            .unwrap_or(0);

            match self.state.gateway.query_quota(&user_id).await {
                Ok(gateway_total) if amount_from_f64(gateway_total) != ledger_sum => {
                    if let Err(err) = self
                        .state
                        .gateway
                        .refresh_quota(&user_id, amount_to_f64(ledger_sum))
                        .await
                    {
                        warn!(error = ?err, user_id, "healer failed to refresh gateway total");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(error = ?err, user_id, "healer failed to read gateway total"),
            }
        }
        Ok(())
    }

    async fn load_valid_rows<'e, E>(&self, user_id: &str, executor: E) -> Result<Vec<QuotaRow>, ServiceError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let rows: Vec<QuotaRow> = sqlx::query_as(
            "SELECT * FROM quota_rows WHERE user_id = $1 AND status = $2 ORDER BY expiry ASC",
        )
        .bind(user_id)
        .bind(QuotaStatus::Valid)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    async fn available_by_expiry(&self, user_id: &str) -> Result<HashMap<DateTime<Utc>, i64>, ServiceError> {
        let gateway_used = self.state.gateway.query_used(user_id).await?;
        let rows = self.load_valid_rows(user_id, &self.state.main_pool).await?;
        let lines = consume_earliest_first(&rows, amount_from_f64(gateway_used));
        Ok(lines.into_iter().map(|l| (l.expiry, l.amount)).collect())
    }

    pub async fn list_audit(
        &self,
        user_id: &str,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<QuotaAudit>, i64), ServiceError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);
        let offset = (page - 1) * page_size;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quota_audits WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.state.main_pool)
            .await?;
        let rows: Vec<QuotaAudit> = sqlx::query_as(
            "SELECT * FROM quota_audits WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.state.main_pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn load_auth_profile(&self, user_id: &str) -> Result<AuthUserProfile, ServiceError> {
        let profile: Option<AuthUserProfile> = sqlx::query_as(
            "SELECT id, name, phone, github_id, starred_projects, employee_number FROM auth_users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.state.auth_pool)
        .await?;
        profile.ok_or(ServiceError::NotFound)
    }
}

/// Applies earliest-first consumption of `used` credits against `rows`
/// (already ordered ascending by expiry), returning the remaining lines —
/// spec.md §4.C `GetUserQuota`'s consumption rule, reused by the transfer-out
/// availability check.
fn consume_earliest_first(rows: &[QuotaRow], mut used: i64) -> Vec<QuotaLine> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if used <= 0 {
            out.push(QuotaLine {
                amount: row.amount,
                expiry: row.expiry,
            });
        } else if row.amount <= used {
            used -= row.amount;
        } else {
            out.push(QuotaLine {
                amount: row.amount - used,
                expiry: row.expiry,
            });
            used = 0;
        }
    }
    out
}

/// Computes a strategy award's expiry timestamp from its `expiry_days` rule
/// (spec.md §3 "Strategy"): null → end of current month; N>0 → now+N days;
/// both at `23:59:59` in the configured timezone.
pub fn compute_expiry(expiry_days: Option<i32>, tz: Tz) -> DateTime<Utc> {
    let now_local = Utc::now().with_timezone(&tz);
    let target_date = match expiry_days {
        Some(days) if days > 0 => (now_local + chrono::Duration::days(days as i64)).date_naive(),
        _ => last_day_of_month(now_local.date_naive()),
    };
    let naive: NaiveDateTime = target_date.and_hms_opt(23, 59, 59).expect("23:59:59 is a valid time");
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn last_day_of_month(date: chrono::NaiveDate) -> chrono::NaiveDate {
    let (year, month) = (date.year(), date.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid calendar date")
        .pred_opt()
        .expect("month has at least one day")
}

fn amount_to_f64(amount: i64) -> f64 {
    amount as f64
}

fn amount_from_f64(value: f64) -> i64 {
    value.round() as i64
}

async fn upsert_valid_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    amount: i64,
    expiry: DateTime<Utc>,
) -> Result<(), ServiceError> {
    sqlx::query(
        "INSERT INTO quota_rows (id, user_id, amount, expiry, status)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (user_id, expiry, status)
         DO UPDATE SET amount = quota_rows.amount + excluded.amount",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(expiry)
    .bind(QuotaStatus::Valid)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn decrement_valid_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    expiry: DateTime<Utc>,
    amount: i64,
) -> Result<(), ServiceError> {
    // Locks the row for the remainder of the transaction so two concurrent
    // transfer-outs against the same (user_id, expiry) row serialize instead
    // of both reading the pre-decrement amount.
    let row: Option<QuotaRow> = sqlx::query_as(
        "SELECT * FROM quota_rows WHERE user_id = $1 AND expiry = $2 AND status = $3 FOR UPDATE",
    )
    .bind(user_id)
    .bind(expiry)
    .bind(QuotaStatus::Valid)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Err(ServiceError::InsufficientQuota);
    };
    if row.amount < amount {
        return Err(ServiceError::InsufficientQuota);
    }
    let remainder = row.amount - amount;
    if remainder == 0 {
        delete_row(tx, row.id).await?;
    } else {
        update_row_amount(tx, row.id, remainder).await?;
    }
    Ok(())
}

async fn delete_row(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, id: Uuid) -> Result<(), ServiceError> {
    sqlx::query("DELETE FROM quota_rows WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn update_row_amount(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    amount: i64,
) -> Result<(), ServiceError> {
    sqlx::query("UPDATE quota_rows SET amount = $1 WHERE id = $2")
        .bind(amount)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    delta: i64,
    operation: AuditOperation,
    voucher_code: Option<&str>,
    related_user: Option<&str>,
    strategy_name: Option<&str>,
    earliest_expiry: Option<DateTime<Utc>>,
    detail: serde_json::Value,
) -> Result<(), ServiceError> {
    sqlx::query(
        "INSERT INTO quota_audits (id, user_id, delta, operation, voucher_code, related_user, strategy_name, earliest_expiry, detail, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(delta)
    .bind(operation)
    .bind(voucher_code)
    .bind(related_user)
    .bind(strategy_name)
    .bind(earliest_expiry)
    .bind(detail)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_monthly_usage(
    pool: &sqlx::PgPool,
    user_id: &str,
    period: &str,
    used_quota_value: i64,
) -> Result<(), ServiceError> {
    sqlx::query(
        "INSERT INTO monthly_quota_usage (user_id, period, used_quota_value, record_time)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, period) DO UPDATE SET used_quota_value = excluded.used_quota_value, record_time = excluded.record_time",
    )
    .bind(user_id)
    .bind(period)
    .bind(used_quota_value)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(amount: i64, expiry: DateTime<Utc>) -> QuotaRow {
        QuotaRow {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            amount,
            expiry,
            status: QuotaStatus::Valid,
        }
    }

    #[test]
    fn consume_earliest_first_drops_fully_covered_rows() {
        let e1 = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap();
        let e2 = Utc.with_ymd_and_hms(2025, 7, 31, 23, 59, 59).unwrap();
        let rows = vec![row(50, e1), row(100, e2)];
        let lines = consume_earliest_first(&rows, 70);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].amount, 80);
        assert_eq!(lines[0].expiry, e2);
    }

    #[test]
    fn consume_earliest_first_with_no_usage_returns_all_rows() {
        let e1 = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap();
        let rows = vec![row(50, e1)];
        let lines = consume_earliest_first(&rows, 0);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].amount, 50);
    }

    #[test]
    fn compute_expiry_defaults_to_end_of_month() {
        let tz = chrono_tz::UTC;
        let expiry = compute_expiry(None, tz);
        let local = expiry.with_timezone(&tz);
        assert_eq!(local.time().to_string(), "23:59:59");
    }

    #[test]
    fn last_day_of_month_handles_december() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 12, 15).unwrap();
        assert_eq!(
            last_day_of_month(date),
            chrono::NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }
}
