//! Scheduler kernel (spec §4.H): a single cron, second precision, bound to
//! the configured timezone, owning a map from strategy id to its registered
//! job handle so strategy CRUD can register/unregister live.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

type AsyncJobFn = dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

/// Thin wrapper over [`tokio_cron_scheduler::JobScheduler`] adding the
/// strategy-id-keyed registration table described in spec §9 ("Cron with
/// live registration"). Every job it schedules runs against the single
/// configured IANA timezone (spec §4.H), not the host's local time.
pub struct SchedulerKernel {
    inner: JobScheduler,
    strategy_jobs: Mutex<HashMap<i64, Uuid>>,
    tz: Tz,
}

impl SchedulerKernel {
    pub async fn new(tz: Tz) -> Result<Self, JobSchedulerError> {
        let inner = JobScheduler::new().await?;
        Ok(Self {
            inner,
            strategy_jobs: Mutex::new(HashMap::new()),
            tz,
        })
    }

    pub async fn start(&self) -> Result<(), JobSchedulerError> {
        self.inner.start().await
    }

    /// Stops the cron and gives in-flight jobs up to [`SHUTDOWN_DRAIN`] to
    /// finish (spec §4.H). Called after the HTTP server's own graceful
    /// shutdown has already drained in-flight requests.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.inner.shutdown().await {
            error!(error = ?err, "scheduler shutdown reported an error");
        }
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
    }

    /// Registers (or re-registers, replacing any prior job) a periodic
    /// strategy under its own cron expression.
    pub async fn register_strategy(
        &self,
        strategy_id: i64,
        cron_expression: &str,
        task: Arc<AsyncJobFn>,
    ) -> Result<(), JobSchedulerError> {
        self.unregister_strategy(strategy_id).await?;
        let job = Job::new_async_tz(cron_expression, self.tz, move |_uuid, _scheduler| {
            let task = Arc::clone(&task);
            Box::pin(async move { (task)().await })
        })?;
        let job_id = self.inner.add(job).await?;
        self.strategy_jobs.lock().insert(strategy_id, job_id);
        info!(strategy_id, cron = cron_expression, "registered strategy cron job");
        Ok(())
    }

    /// Unregisters a strategy's job, if one is currently registered.
    pub async fn unregister_strategy(&self, strategy_id: i64) -> Result<(), JobSchedulerError> {
        let existing = self.strategy_jobs.lock().remove(&strategy_id);
        if let Some(job_id) = existing {
            self.inner.remove(&job_id).await?;
            info!(strategy_id, "unregistered strategy cron job");
        }
        Ok(())
    }

    /// Registers a fixed (non-strategy) job: the single-strategy scanner,
    /// the monthly expiry pass, the daily HR sync, or the Gateway
    /// reconciliation pass.
    pub async fn register_fixed(
        &self,
        cron_expression: &str,
        task: Arc<AsyncJobFn>,
    ) -> Result<Uuid, JobSchedulerError> {
        let job = Job::new_async_tz(cron_expression, self.tz, move |_uuid, _scheduler| {
            let task = Arc::clone(&task);
            Box::pin(async move { (task)().await })
        })?;
        self.inner.add(job).await
    }
}
