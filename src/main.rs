use std::net::SocketAddr;
use std::sync::Arc;

use axum::{serve, Extension};
use dotenvy::dotenv;
use quota_manager::{
    api,
    infrastructure::{config::Config, db, gateway::GatewayClient, scheduler::SchedulerKernel, state::AppState},
    jobs,
    services::{hr_sync::HrSyncService, strategy::StrategyService},
    telemetry,
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    telemetry::init();
    let config = Arc::new(Config::from_env()?);

    let main_pool = db::connect_main(&config.database).await?;
    db::run_migrations(&main_pool).await?;
    info!("database migrations completed successfully");
    let auth_pool = db::connect_auth(&config.auth_database).await?;

    let gateway = GatewayClient::new(&config.aigateway);
    let scheduler = SchedulerKernel::new(config.server.tz()).await?;
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        main_pool,
        auth_pool,
        gateway,
        scheduler,
    ));

    let strategy_service = Arc::new(StrategyService::new(Arc::clone(&state)));
    strategy_service.register_enabled_periodic().await?;

    let hr_sync = HrSyncService::new(Arc::clone(&state));
    hr_sync.run_if_empty_at_boot().await?;

    jobs::register_fixed_jobs(Arc::clone(&state)).await?;

    {
        let scheduler = state.scheduler.read().await;
        scheduler.start().await?;
    }

    let router = api::build_router().layer(Extension(Arc::clone(&state)));

    let addr: SocketAddr = config.bind_address().parse()?;
    info!(%addr, "starting quota manager api");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        warn!(error = ?err, "server exited with error");
    }
    info!("http server drained, shutting down scheduler");

    {
        let mut scheduler = state.scheduler.write().await;
        scheduler.shutdown().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
