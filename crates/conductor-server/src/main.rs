mod auth;
mod config;
mod error;
mod handlers;
mod serve_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use conductor_core::config::CoreConfig;
use conductor_db::pool;

#[derive(Parser)]
#[command(name = "conductor", about = "Durable orchestrator for DAGs of agent tasks")]
struct Cli {
    /// Database URL (overrides CONDUCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Path to the config file
    #[arg(long, global = true, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a conductor config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/conductor")]
        db_url: String,
        /// Shared secret for verifying bearer tokens
        #[arg(long, default_value = "dev-secret-change-me")]
        jwt_secret: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and apply migrations
    DbInit,
    /// Run the API server, result consumer, and scheduler
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port (overrides config and CONDUCTOR_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            jwt_secret,
            force,
        } => {
            if cli.config.exists() && !force {
                anyhow::bail!(
                    "config file {} already exists (use --force to overwrite)",
                    cli.config.display()
                );
            }
            let file = config::ConfigFile {
                database: config::DatabaseSection { url: db_url },
                auth: config::AuthSection { jwt_secret },
                server: config::ServerSection::default(),
            };
            config::save_config(&cli.config, &file)?;
            println!("wrote {}", cli.config.display());
            Ok(())
        }
        Commands::DbInit => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref(), &cli.config);
            pool::ensure_database_exists(&db_config).await?;
            let db_pool = pool::create_pool(&db_config).await?;
            pool::run_migrations(&db_pool, pool::migrations_dir()).await?;
            let name = db_config.database_name().unwrap_or("conductor");
            println!("database {name} ready");
            Ok(())
        }
        Commands::Serve { bind, port } => {
            let db_config = config::resolve_db_config(cli.database_url.as_deref(), &cli.config);
            let db_pool = pool::create_pool(&db_config)
                .await
                .context("failed to connect to database")?;

            let mut core = CoreConfig::from_env();
            if let Some(secret) = config::resolve_jwt_secret(&cli.config) {
                core.jwt_secret = secret;
            }
            let port = port
                .or_else(|| config::load_config(&cli.config).ok().and_then(|f| f.server.port))
                .unwrap_or(core.port);

            serve_cmd::run_serve(db_pool, core, &bind, port).await
        }
    }
}
