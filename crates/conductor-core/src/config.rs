//! Runtime configuration for the orchestrator and its background loops.
//!
//! Everything reads from the environment with defaults suitable for local
//! development; the server binary layers a TOML config file underneath.

use std::env;
use std::time::Duration;

/// Credentials and model selection for one LLM provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Display name used in logs ("primary", "fallback-1", ...).
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl ProviderConfig {
    /// A provider without credentials is skipped by the planner fan-out.
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Object storage settings. The core only tracks keys; workers upload and
/// the API downloads through these settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub port: u16,
    pub jwt_secret: String,
    /// Terminal jobs older than this are garbage collected.
    pub retention_days: i64,
    pub scheduler_tick: Duration,
    /// Wall-clock limit for a running task before the stuck scan fails it.
    pub task_timeout: Duration,
    /// Uniform retry policy: attempts after the first failure.
    pub max_retries: i32,
    /// Deliveries before a message is routed to the dead-letter queue.
    pub redelivery_limit: i32,
    /// Lease duration for claimed broker messages.
    pub queue_lease: Duration,
    pub providers: Vec<ProviderConfig>,
    pub storage: StorageConfig,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CoreConfig {
    /// Build the configuration from the environment.
    pub fn from_env() -> Self {
        let providers = vec![
            ProviderConfig {
                name: "primary".to_owned(),
                base_url: env_or(
                    "CONDUCTOR_LLM_PRIMARY_URL",
                    "https://api.anthropic.com/v1",
                ),
                api_key: env::var("CONDUCTOR_LLM_PRIMARY_KEY").ok(),
                model: env_or("CONDUCTOR_LLM_PRIMARY_MODEL", "claude-sonnet-4-5"),
            },
            ProviderConfig {
                name: "fallback-1".to_owned(),
                base_url: env_or("CONDUCTOR_LLM_FALLBACK1_URL", "https://api.openai.com/v1"),
                api_key: env::var("CONDUCTOR_LLM_FALLBACK1_KEY").ok(),
                model: env_or("CONDUCTOR_LLM_FALLBACK1_MODEL", "gpt-4o"),
            },
            ProviderConfig {
                name: "fallback-2".to_owned(),
                base_url: env_or(
                    "CONDUCTOR_LLM_FALLBACK2_URL",
                    "https://generativelanguage.googleapis.com/v1beta",
                ),
                api_key: env::var("CONDUCTOR_LLM_FALLBACK2_KEY").ok(),
                model: env_or("CONDUCTOR_LLM_FALLBACK2_MODEL", "gemini-2.0-flash"),
            },
        ];

        Self {
            port: env_parse("CONDUCTOR_PORT", 8700),
            jwt_secret: env_or("CONDUCTOR_JWT_SECRET", "dev-secret-change-me"),
            retention_days: env_parse("CONDUCTOR_RETENTION_DAYS", 7),
            scheduler_tick: Duration::from_secs(env_parse("CONDUCTOR_TICK_SECONDS", 30)),
            task_timeout: Duration::from_secs(env_parse("CONDUCTOR_TASK_TIMEOUT_SECONDS", 600)),
            max_retries: env_parse("CONDUCTOR_MAX_RETRIES", 3),
            redelivery_limit: env_parse("CONDUCTOR_REDELIVERY_LIMIT", 5),
            queue_lease: Duration::from_secs(env_parse("CONDUCTOR_QUEUE_LEASE_SECONDS", 60)),
            providers,
            storage: StorageConfig {
                endpoint: env_or("CONDUCTOR_STORAGE_ENDPOINT", "http://localhost:9000"),
                bucket: env_or("CONDUCTOR_STORAGE_BUCKET", "conductor-artifacts"),
                access_key: env::var("CONDUCTOR_STORAGE_ACCESS_KEY").ok(),
                secret_key: env::var("CONDUCTOR_STORAGE_SECRET_KEY").ok(),
            },
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
