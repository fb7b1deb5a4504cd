//! Postgres fixtures for conductor's integration tests.
//!
//! One Postgres server is shared per test binary: either an external one
//! named by `CONDUCTOR_TEST_PG_URL` (nextest setup script, CI service
//! container), or a testcontainers instance started lazily on first use.
//! Every test provisions its own database inside that server, and the
//! provisioning goes through the same `conductor-db` helpers production
//! uses (`ensure_database_exists`, `create_pool`, `run_migrations`), so
//! the tests exercise the real bootstrap path instead of a parallel one.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use conductor_db::config::DbConfig;
use conductor_db::pool;

struct SharedServer {
    /// Server root URL, no database segment.
    base_url: String,
    /// Held to keep the container alive; `None` for an external server.
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<SharedServer> = OnceCell::const_new();

async fn shared_server() -> &'static SharedServer {
    SERVER
        .get_or_init(|| async {
            if let Ok(base_url) = std::env::var("CONDUCTOR_TEST_PG_URL") {
                return SharedServer {
                    base_url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            SharedServer {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// An isolated, migrated database for one test.
pub struct TestDb {
    pub pool: PgPool,
    config: DbConfig,
}

impl TestDb {
    /// Provision a fresh database on the shared server and bring its
    /// schema current.
    ///
    /// The pool is deliberately small: tests run many databases side by
    /// side and the serve-process default would exhaust the server's
    /// connection slots.
    pub async fn provision() -> Self {
        let base_url = &shared_server().await.base_url;
        let name = format!("conductor_it_{}", Uuid::new_v4().simple());
        let config = DbConfig::new(format!("{base_url}/{name}")).with_max_connections(5);

        pool::ensure_database_exists(&config)
            .await
            .expect("test database creation should succeed");
        let pool = pool::create_pool(&config)
            .await
            .expect("test database pool should connect");
        pool::run_migrations(&pool, pool::migrations_dir())
            .await
            .expect("migrations should apply");

        Self { pool, config }
    }

    /// Close the pool and drop the database.
    ///
    /// Kicks lingering connections first so `DROP DATABASE` cannot hang
    /// on a pool that a panicking test left behind. Errors are ignored:
    /// the shared server is torn down with the container either way.
    pub async fn teardown(self) {
        self.pool.close().await;

        let Some(name) = self.config.database_name().map(str::to_owned) else {
            return;
        };
        let Ok(admin) = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&self.config.maintenance_url())
            .await
        else {
            return;
        };

        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{name}' AND pid <> pg_backend_pid()"
        );
        let _ = admin.execute(terminate.as_str()).await;
        let drop_db = format!("DROP DATABASE IF EXISTS {name}");
        let _ = admin.execute(drop_db.as_str()).await;
        admin.close().await;
    }
}
