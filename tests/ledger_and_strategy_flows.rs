use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use quota_manager::{
    domain::models::{AuditOperation, AuthUserProfile, QuotaStatus, StrategyKind},
    infrastructure::{
        config::{
            AiGatewayConfig, Config, DatabaseConfig, EmployeeSyncConfig, GithubStarCheckConfig,
            LogConfig, SchedulerConfig, ServerConfig, VoucherConfig,
        },
        gateway::GatewayClient,
        scheduler::SchedulerKernel,
        state::AppState,
    },
    services::{
        ledger::{LedgerService, RequestedLine, TransferInStatus},
        strategy::{NewStrategy, StrategyService},
    },
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

#[path = "test_harness.rs"]
mod test_harness;

use test_harness::run_test;

#[tokio::test]
async fn transfer_out_race_serializes_on_same_row() -> Result<()> {
    run_test(run_transfer_out_race).await
}

#[tokio::test]
async fn transfer_out_then_transfer_in_round_trips_credits() -> Result<()> {
    run_test(run_transfer_round_trip).await
}

#[tokio::test]
async fn strategy_scan_respects_max_exec_per_user() -> Result<()> {
    run_test(run_strategy_scan_respects_limit).await
}

#[tokio::test]
async fn expire_quotas_moves_valid_rows_to_expired() -> Result<()> {
    run_test(run_expire_quotas).await
}

/// Two concurrent `TransferOut`s draining the same (user, expiry) row: only
/// one should win the row lock added in `decrement_valid_row`, and the sum
/// deducted must never exceed what was actually on the row (spec §5, §8
/// property 3 — conservation across transfer).
async fn run_transfer_out_race(pool: PgPool) -> Result<()> {
    let gateway_addr = spawn_mock_gateway().await;
    let state = build_state(pool.clone(), gateway_addr).await?;
    let ledger = Arc::new(LedgerService::new(Arc::clone(&state)));

    let giver_id = format!("giver-{}", Uuid::new_v4());
    let expiry = Utc::now() + Duration::days(30);
    insert_quota_row(&pool, &giver_id, 100, expiry).await?;

    let giver = AuthUserProfile {
        id: giver_id.clone(),
        name: "Race Giver".to_string(),
        phone: None,
        github_id: None,
        starred_projects: String::new(),
        employee_number: None,
    };

    let receiver_a = format!("receiver-a-{}", Uuid::new_v4());
    let receiver_b = format!("receiver-b-{}", Uuid::new_v4());
    let lines = vec![RequestedLine { amount: 70, expiry }];

    let (task_a, task_b) = (
        tokio::spawn({
            let ledger = Arc::clone(&ledger);
            let giver = giver.clone();
            let lines = lines.clone();
            async move { ledger.transfer_out(&giver, &receiver_a, lines).await }
        }),
        tokio::spawn({
            let ledger = Arc::clone(&ledger);
            let giver = giver.clone();
            let lines = lines.clone();
            async move { ledger.transfer_out(&giver, &receiver_b, lines).await }
        }),
    );

    let (result_a, result_b) = (task_a.await?, task_b.await?);
    let outcomes = [&result_a, &result_b];

    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of the two conflicting transfer-outs should succeed");

    let insufficient = outcomes
        .iter()
        .filter(|r| matches!(r, Err(quota_manager::services::errors::ServiceError::InsufficientQuota)))
        .count();
    assert_eq!(insufficient, 1, "the losing transfer-out should see insufficient quota, not a clobbered read");

    let remaining: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
    )
    .bind(&giver_id)
    .bind(QuotaStatus::Valid)
    .fetch_one(&pool)
    .await?;
    assert_eq!(remaining, 30, "exactly one 70-unit deduction should have landed, not zero or two");

    cleanup_ledger(&pool, &[giver_id.as_str()]).await?;
    Ok(())
}

/// A voucher issued by `TransferOut` and redeemed by `TransferIn` must move
/// exactly the transferred amount from giver to receiver, and a replayed
/// redemption must be rejected rather than double-crediting (spec §8
/// property 3, scenario "voucher redeemed exactly once").
async fn run_transfer_round_trip(pool: PgPool) -> Result<()> {
    let gateway_addr = spawn_mock_gateway().await;
    let state = build_state(pool.clone(), gateway_addr).await?;
    let ledger = LedgerService::new(Arc::clone(&state));

    let giver_id = format!("giver-{}", Uuid::new_v4());
    let receiver_id = format!("receiver-{}", Uuid::new_v4());
    let expiry = Utc::now() + Duration::days(30);
    insert_quota_row(&pool, &giver_id, 50, expiry).await?;

    let giver = AuthUserProfile {
        id: giver_id.clone(),
        name: "Giver".to_string(),
        phone: None,
        github_id: None,
        starred_projects: String::new(),
        employee_number: None,
    };
    let receiver = AuthUserProfile {
        id: receiver_id.clone(),
        name: "Receiver".to_string(),
        phone: None,
        github_id: None,
        starred_projects: String::new(),
        employee_number: None,
    };

    let out = ledger
        .transfer_out(&giver, &receiver_id, vec![RequestedLine { amount: 50, expiry }])
        .await?;

    let giver_remaining: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
    )
    .bind(&giver_id)
    .bind(QuotaStatus::Valid)
    .fetch_one(&pool)
    .await?;
    assert_eq!(giver_remaining, 0, "giver's row should be fully drained, not left dangling");

    let redeemed = ledger.transfer_in(&receiver, &out.voucher_code).await?;
    assert_eq!(redeemed.status, TransferInStatus::Success);
    assert_eq!(redeemed.amount, 50);

    let receiver_total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
    )
    .bind(&receiver_id)
    .bind(QuotaStatus::Valid)
    .fetch_one(&pool)
    .await?;
    assert_eq!(receiver_total, 50, "the full transferred amount should land on the receiver");

    let replay = ledger.transfer_in(&receiver, &out.voucher_code).await?;
    assert_eq!(replay.status, TransferInStatus::AlreadyRedeemed);
    assert_eq!(replay.amount, 0, "a replayed redemption must not credit the receiver again");

    let receiver_total_after_replay: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
    )
    .bind(&receiver_id)
    .bind(QuotaStatus::Valid)
    .fetch_one(&pool)
    .await?;
    assert_eq!(receiver_total_after_replay, 50);

    cleanup_ledger(&pool, &[giver_id.as_str(), receiver_id.as_str()]).await?;
    Ok(())
}

/// `max_exec_per_user` (spec §3) caps completed executions per user; a
/// periodic scan run twice must not recharge the same user a second time
/// once the cap is hit.
async fn run_strategy_scan_respects_limit(pool: PgPool) -> Result<()> {
    let gateway_addr = spawn_mock_gateway().await;
    let state = build_state(pool.clone(), gateway_addr).await?;
    let strategy_service = Arc::new(StrategyService::new(Arc::clone(&state)));

    let user_id = format!("emp-{}", Uuid::new_v4());
    insert_auth_user(&pool, &user_id).await?;

    let strategy = strategy_service
        .create(NewStrategy {
            name: format!("capped-{}", Uuid::new_v4()),
            title: "Capped recharge".to_string(),
            kind: StrategyKind::Single,
            amount: 10,
            model_label: None,
            cron_expression: None,
            condition: "true()".to_string(),
            expiry_days: None,
            enabled: true,
            max_exec_per_user: 1,
        })
        .await?;

    strategy_service.run_scan().await?;
    strategy_service.run_scan().await?;

    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM execution_records WHERE strategy_id = $1 AND user_id = $2 AND status = 'completed'",
    )
    .bind(strategy.id)
    .bind(&user_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(completed, 1, "max_exec_per_user=1 must stop the second scan from recharging again");

    let total_recharged: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM quota_rows WHERE user_id = $1 AND status = $2",
    )
    .bind(&user_id)
    .bind(QuotaStatus::Valid)
    .fetch_one(&pool)
    .await?;
    assert_eq!(total_recharged, 10, "the user should only have been recharged once, not twice");

    sqlx::query("DELETE FROM execution_records WHERE strategy_id = $1")
        .bind(strategy.id)
        .execute(&pool)
        .await?;
    sqlx::query("DELETE FROM strategies WHERE id = $1")
        .bind(strategy.id)
        .execute(&pool)
        .await?;
    cleanup_ledger(&pool, &[user_id.as_str()]).await?;
    sqlx::query("DELETE FROM auth_users WHERE id = $1")
        .bind(&user_id)
        .execute(&pool)
        .await?;
    Ok(())
}

/// A quota row past its expiry must flip to `EXPIRED` and produce an
/// `EXPIRE` audit entry for the full expired amount (spec §8 properties
/// 5 and 8).
async fn run_expire_quotas(pool: PgPool) -> Result<()> {
    let gateway_addr = spawn_mock_gateway().await;
    let state = build_state(pool.clone(), gateway_addr).await?;
    let ledger = LedgerService::new(Arc::clone(&state));

    let user_id = format!("expiring-{}", Uuid::new_v4());
    let past_expiry = Utc::now() - Duration::days(1);
    insert_quota_row(&pool, &user_id, 40, past_expiry).await?;

    ledger.expire_quotas().await?;

    let status: String = sqlx::query_scalar("SELECT status FROM quota_rows WHERE user_id = $1")
        .bind(&user_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, "EXPIRED");

    let audit_delta: i64 = sqlx::query_scalar(
        "SELECT delta FROM quota_audits WHERE user_id = $1 AND operation = $2",
    )
    .bind(&user_id)
    .bind(AuditOperation::Expire)
    .fetch_one(&pool)
    .await?;
    assert_eq!(audit_delta, -40);

    cleanup_ledger(&pool, &[user_id.as_str()]).await?;
    Ok(())
}

async fn insert_quota_row(
    pool: &PgPool,
    user_id: &str,
    amount: i64,
    expiry: chrono::DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO quota_rows (id, user_id, amount, expiry, status) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(expiry)
    .bind(QuotaStatus::Valid)
    .execute(pool)
    .await?;
    Ok(())
}

/// The auth store is external (spec §3 "Ownership") and not covered by this
/// crate's migrations; tests stand up a minimal shape of it themselves.
async fn insert_auth_user(pool: &PgPool, user_id: &str) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS auth_users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            github_id TEXT,
            starred_projects TEXT NOT NULL DEFAULT '',
            employee_number TEXT,
            registered_at TIMESTAMPTZ NOT NULL,
            last_access_at TIMESTAMPTZ,
            vip_level BIGINT NOT NULL DEFAULT 0,
            company TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO auth_users
            (id, name, phone, github_id, starred_projects, employee_number, registered_at, last_access_at, vip_level, company)
         VALUES ($1, $2, NULL, NULL, '', NULL, $3, NULL, 0, NULL)",
    )
    .bind(user_id)
    .bind(format!("Employee {user_id}"))
    .bind(Utc::now() - Duration::days(365))
    .execute(pool)
    .await?;
    Ok(())
}

async fn cleanup_ledger(pool: &PgPool, user_ids: &[&str]) -> Result<()> {
    for user_id in user_ids {
        sqlx::query("DELETE FROM quota_rows WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM quota_audits WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM voucher_redemptions WHERE receiver_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// A one-shot HTTP stand-in for the upstream AI Gateway: every GET returns an
/// envelope with every `data` shape the client might deserialize, every POST
/// is accepted. Good enough for exercising the ledger/strategy code paths
/// that call through `GatewayClient` without standing up the real Gateway.
async fn spawn_mock_gateway() -> SocketAddr {
    let app = Router::new().fallback(mock_gateway_envelope);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("mock gateway should bind an ephemeral port");
    let addr = listener.local_addr().expect("bound listener has a local address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    addr
}

async fn mock_gateway_envelope() -> Json<serde_json::Value> {
    Json(json!({
        "code": "ok",
        "message": "ok",
        "success": true,
        "data": {
            "quota": 0.0,
            "used": 0.0,
            "star_value": "",
            "value": false,
            "models": [] as [String; 0],
        }
    }))
}

async fn build_state(pool: PgPool, gateway_addr: SocketAddr) -> Result<Arc<AppState>> {
    let config = Arc::new(Config {
        server: ServerConfig::default(),
        database: DatabaseConfig::default(),
        auth_database: DatabaseConfig::default(),
        aigateway: AiGatewayConfig {
            host: gateway_addr.ip().to_string(),
            port: gateway_addr.port(),
            admin_path: String::new(),
            auth_header: "x-admin-key".to_string(),
            auth_value: "test-key".to_string(),
            timeout_seconds: 5,
        },
        scheduler: SchedulerConfig::default(),
        voucher: VoucherConfig {
            signing_key: "0123456789abcdef0123456789abcdef".to_string(),
        },
        log: LogConfig::default(),
        employee_sync: EmployeeSyncConfig::default(),
        github_star_check: GithubStarCheckConfig::default(),
    });

    let gateway = GatewayClient::new(&config.aigateway);
    let scheduler = SchedulerKernel::new(config.server.tz()).await?;
    Ok(Arc::new(AppState::new(
        Arc::clone(&config),
        pool.clone(),
        pool,
        gateway,
        scheduler,
    )))
}
