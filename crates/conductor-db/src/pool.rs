//! Connection pool construction and schema management.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Open a pool sized per the config.
///
/// The URL shape is checked first so a bad scheme or database name fails
/// with a clear message rather than a connect timeout.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    config.validate()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to {}", config.redacted()))?;

    info!(
        db = config.database_name().unwrap_or_default(),
        pool_size = config.max_connections,
        "database pool ready"
    );
    Ok(pool)
}

/// Directory holding this crate's migration files.
///
/// Resolves against the conductor-db source tree via the compile-time
/// `CARGO_MANIFEST_DIR`; installed binaries that outlive the source tree
/// must ship the directory alongside and pass their own path to
/// [`run_migrations`].
pub fn migrations_dir() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

/// Apply pending migrations from `dir`.
///
/// The migrator is loaded at runtime (not the `sqlx::migrate!()` macro)
/// so building the workspace never requires a live database. Both
/// `conductor db-init` and the test harness drive this against
/// [`migrations_dir`].
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    migrator
        .run(pool)
        .await
        .context("failed to apply database migrations")?;

    info!(migrations = migrator.iter().count(), "schema is current");
    Ok(())
}

/// Create the configured database when it does not exist yet.
///
/// Issues `CREATE DATABASE` through the maintenance database on the same
/// server. The name interpolation is safe because [`DbConfig::validate`]
/// restricts names to identifier characters.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    config.validate()?;
    let name = config
        .database_name()
        .context("database URL names no database")?;

    let maintenance = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.maintenance_url())
        .await
        .with_context(|| {
            format!(
                "failed to reach the maintenance database for {}",
                config.redacted()
            )
        })?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&maintenance)
            .await
            .context("failed to query pg_database")?;

    if !exists {
        let stmt = format!("CREATE DATABASE {name}");
        maintenance
            .execute(stmt.as_str())
            .await
            .with_context(|| format!("failed to create database {name}"))?;
        info!(db = name, "database created");
    }

    maintenance.close().await;
    Ok(())
}
