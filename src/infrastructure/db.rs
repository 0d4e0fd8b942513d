use anyhow::Context;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

use super::config::DatabaseConfig;

pub type PgPool = sqlx::Pool<sqlx::Postgres>;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connects to the main store (ledger, strategy, policy, audit tables).
/// Write-heavy; spec §5 sizes this pool around 100 connections.
pub async fn connect_main(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url())
        .await
        .with_context(|| "failed to connect to the main PostgreSQL database")
}

/// Connects to the read-only authenticated-user store. The core never
/// writes through this pool (spec §3 "Ownership").
pub async fn connect_auth(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url())
        .await
        .with_context(|| "failed to connect to the auth PostgreSQL database")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .with_context(|| "failed to run database migrations")
}
