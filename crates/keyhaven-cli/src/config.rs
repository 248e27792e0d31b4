//! Host configuration.
//!
//! Read from `keyhaven.toml` (every key optional), then overridden by
//! environment variables.  A `.env` file in the working directory is loaded
//! first so it can supply those variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use zeroize::Zeroizing;

pub const DATA_DIR_ENV: &str = "KEYHAVEN_DATA_DIR";
pub const LOG_ENV: &str = "KEYHAVEN_LOG";
pub const PASSWORD_ENV: &str = "KEYHAVEN_PASSWORD";

const DB_FILE: &str = "keyhaven.db";

/// Settings for the `keyhaven` process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON objects instead of compact text.
    pub log_json: bool,
    /// `User-Agent` sent on upstream calls.
    pub user_agent: String,
    /// Connection establishment timeout for upstream calls.
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_level: "info".to_owned(),
            log_json: false,
            user_agent: format!("keyhaven/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Load `path` and apply process environment overrides.
    pub fn from_env(path: &Path) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e).context("failed to load .env");
            }
        }
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(LOG_ENV).filter(|v| !v.is_empty()) {
            self.log_level = level;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Master password for non-interactive unlock, if set.
pub fn password_from_env() -> Option<Zeroizing<String>> {
    password_from(|key| std::env::var(key).ok())
}

fn password_from(lookup: impl Fn(&str) -> Option<String>) -> Option<Zeroizing<String>> {
    lookup(PASSWORD_ENV)
        .filter(|p| !p.is_empty())
        .map(Zeroizing::new)
}
