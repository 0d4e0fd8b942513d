//! Boot-time wiring for the fixed (non-strategy) cron jobs named in spec
//! §4.H: the single-strategy scanner, the monthly expiry pass, the daily HR
//! sync, and the periodic Gateway reconciliation pass.

use std::sync::Arc;

use tracing::error;

use crate::infrastructure::state::AppState;
use crate::services::errors::ServiceError;
use crate::services::hr_sync::HrSyncService;
use crate::services::ledger::LedgerService;
use crate::services::strategy::StrategyService;

const MONTHLY_EXPIRY_CRON: &str = "0 0 0 1 * *";
const DAILY_HR_SYNC_CRON: &str = "0 0 1 * * *";
const SCANNER_DEBUG_CRON: &str = "*/10 * * * * *";
const SCANNER_RELEASE_CRON: &str = "0 0 * * * *";

/// Registers every fixed job onto the scheduler kernel already held in
/// `state`. Must run after `StrategyService::register_enabled_periodic` and
/// before the kernel is started.
pub async fn register_fixed_jobs(state: Arc<AppState>) -> Result<(), ServiceError> {
    let scanner_cron = state
        .config
        .scheduler
        .scan_interval
        .clone()
        .unwrap_or_else(|| {
            if state.config.server.is_debug() {
                SCANNER_DEBUG_CRON.to_string()
            } else {
                SCANNER_RELEASE_CRON.to_string()
            }
        });

    {
        let strategy_state = Arc::clone(&state);
        let task = Arc::new(move || {
            let strategy_state = Arc::clone(&strategy_state);
            Box::pin(async move {
                let svc = StrategyService::new(Arc::clone(&strategy_state));
                if let Err(err) = svc.run_scan().await {
                    error!(error = ?err, "single-strategy scan failed");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });
        let scheduler = state.scheduler.read().await;
        scheduler
            .register_fixed(&scanner_cron, task)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
    }

    {
        let ledger_state = Arc::clone(&state);
        let task = Arc::new(move || {
            let ledger_state = Arc::clone(&ledger_state);
            Box::pin(async move {
                let ledger = LedgerService::new(Arc::clone(&ledger_state));
                if let Err(err) = ledger.expire_quotas().await {
                    error!(error = ?err, "monthly expiry pass failed");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });
        let scheduler = state.scheduler.read().await;
        scheduler
            .register_fixed(MONTHLY_EXPIRY_CRON, task)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
    }

    {
        let hr_state = Arc::clone(&state);
        let task = Arc::new(move || {
            let hr_state = Arc::clone(&hr_state);
            Box::pin(async move {
                let svc = HrSyncService::new(Arc::clone(&hr_state));
                if let Err(err) = svc.run_sync().await {
                    error!(error = ?err, "daily HR sync failed");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });
        let scheduler = state.scheduler.read().await;
        scheduler
            .register_fixed(DAILY_HR_SYNC_CRON, task)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
    }

    {
        let gateway_sync_cron = state.config.scheduler.gateway_sync_interval.clone();
        let reconcile_state = Arc::clone(&state);
        let task = Arc::new(move || {
            let reconcile_state = Arc::clone(&reconcile_state);
            Box::pin(async move {
                let ledger = LedgerService::new(Arc::clone(&reconcile_state));
                if let Err(err) = ledger.sync_quotas_with_ai_gateway().await {
                    error!(error = ?err, "gateway reconciliation pass failed");
                }
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        });
        let scheduler = state.scheduler.read().await;
        scheduler
            .register_fixed(&gateway_sync_cron, task)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
    }

    Ok(())
}
