//! Configuration file management for conductor.
//!
//! Provides a TOML config file (default `conductor.toml` in the working
//! directory) and a resolution chain: CLI flag > env var > config file >
//! default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use conductor_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Shared secret for verifying bearer tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("conductor.toml")
}

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Resolve the database config: CLI flag > env var > config file > default.
pub fn resolve_db_config(cli_url: Option<&str>, config_path: &Path) -> DbConfig {
    if let Some(url) = cli_url {
        return DbConfig::new(url);
    }
    if let Ok(url) = std::env::var("CONDUCTOR_DATABASE_URL") {
        return DbConfig::new(url);
    }
    if let Ok(file) = load_config(config_path) {
        return DbConfig::new(file.database.url);
    }
    DbConfig::new(DbConfig::DEFAULT_URL)
}

/// Resolve the JWT secret: env var > config file > core default.
pub fn resolve_jwt_secret(config_path: &Path) -> Option<String> {
    if let Ok(secret) = std::env::var("CONDUCTOR_JWT_SECRET") {
        return Some(secret);
    }
    load_config(config_path).ok().map(|f| f.auth.jwt_secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conductor.toml");

        let config = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://localhost:5432/conductor".to_owned(),
            },
            auth: AuthSection {
                jwt_secret: "secret".to_owned(),
            },
            server: ServerSection { port: Some(9000) },
        };

        save_config(&path, &config).expect("save");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.database.url, config.database.url);
        assert_eq!(loaded.auth.jwt_secret, "secret");
        assert_eq!(loaded.server.port, Some(9000));
    }

    #[test]
    fn cli_flag_wins_resolution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.toml");
        let db = resolve_db_config(Some("postgresql://elsewhere:5432/db"), &path);
        assert_eq!(db.database_url, "postgresql://elsewhere:5432/db");
    }
}
