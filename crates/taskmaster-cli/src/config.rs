//! Config file handling for `taskmaster`.
//!
//! Resolution chain for the database URL: `--database-url` flag >
//! `TASKMASTER_DATABASE_URL` env var > config file > compiled-in default.
//! The config file itself lives at `~/.config/taskmaster/config.toml`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use taskmaster_db::config::DbConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

/// The taskmaster config directory: `$XDG_CONFIG_HOME/taskmaster` or
/// `~/.config/taskmaster`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("taskmaster");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("taskmaster")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file, if present.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent directories as
/// needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(config_path(), contents).context("failed to write config file")
}

/// Resolve the database config from the priority chain described above.
pub fn resolve_db_config(cli_database_url: Option<&str>) -> DbConfig {
    if let Some(url) = cli_database_url {
        return DbConfig::new(url);
    }
    if let Ok(url) = std::env::var("TASKMASTER_DATABASE_URL") {
        return DbConfig::new(url);
    }
    if let Ok(file) = load_config() {
        return DbConfig::new(file.database.url);
    }
    DbConfig::new(DbConfig::DEFAULT_URL)
}
