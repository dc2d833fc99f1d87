use anyhow::{anyhow, Result};
use config::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::database::{LockPolicy, ManagerConfig, OpenOptions, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataAccessConfig {
    /// Directory holding the database file
    pub data_dir: String,

    /// File name of the database inside `data_dir`
    pub database_name: String,

    /// Whether the embedded SQL engine may be used at all
    pub with_sqlite: bool,

    /// Engine-level busy timeout
    pub busy_timeout_ms: u64,

    /// How long one attempt waits for the shared file lock
    pub lock_timeout_ms: u64,

    /// Retries for transient busy failures and lock acquisition
    pub max_retries: u32,

    /// Base backoff between retries, doubled after each attempt
    pub retry_backoff_ms: u64,

    pub statement_cache_capacity: usize,
}

const EMPTY_CONFIG: &str = r#"### dataaccess configuration file

### directory holding the database file
# data_dir = "~/.local/share/dataaccess"

### database file name inside data_dir
# database_name = "data.sqlite3"

### set to false to disable the embedded SQL engine
# with_sqlite = true

### timeouts (in milliseconds)
# busy_timeout_ms = 5000
# lock_timeout_ms = 2000

### retry settings for busy databases
# max_retries = 3
# retry_backoff_ms = 25

### prepared statements kept per connection
# statement_cache_capacity = 64
"#;

fn default_data_dir() -> String {
    let base = dirs::data_dir()
        .or_else(dirs::home_dir)
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string());
    format!("{}/dataaccess", base.trim_end_matches('/'))
}

impl Default for DataAccessConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_name: "data.sqlite3".to_string(),
            with_sqlite: true,
            busy_timeout_ms: 5000,
            lock_timeout_ms: 2000,
            max_retries: 3,
            retry_backoff_ms: 25,
            statement_cache_capacity: 64,
        }
    }
}

fn parse_key<T: FromStr>(config: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match config.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid value for {}: {}", key, raw)),
        None => Ok(default),
    }
}

impl DataAccessConfig {
    /// Load the configuration
    ///
    /// Sources, later ones winning: built-in defaults, the TOML file at
    /// `path` (or the default config file if it exists), then `DATAACCESS_*`
    /// environment variables. A missing explicit `path` gets a commented
    /// template written to it.
    pub fn new(path: &Option<String>) -> Result<DataAccessConfig> {
        let mut builder = Config::builder();

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| anyhow!("Unable to create config directory: {}", e))?;
                    }
                    std::fs::write(path, EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                let p = Self::config_file_path();
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                }
            }
        }

        // E.g., `DATAACCESS_DATA_DIR=/tmp/data ./dataaccess status`
        builder = builder.add_source(config::Environment::with_prefix("DATAACCESS"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let config = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        let defaults = DataAccessConfig::default();

        let data_dir = match config.get("data_dir") {
            Some(dir) => expand_home(dir),
            None => defaults.data_dir,
        };

        let database_name = match config.get("database_name") {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            Some(_) => return Err(anyhow!("database_name must not be empty")),
            None => defaults.database_name,
        };

        Ok(DataAccessConfig {
            data_dir,
            database_name,
            with_sqlite: parse_key(&config, "with_sqlite", defaults.with_sqlite)?,
            busy_timeout_ms: parse_key(&config, "busy_timeout_ms", defaults.busy_timeout_ms)?,
            lock_timeout_ms: parse_key(&config, "lock_timeout_ms", defaults.lock_timeout_ms)?,
            max_retries: parse_key(&config, "max_retries", defaults.max_retries)?,
            retry_backoff_ms: parse_key(&config, "retry_backoff_ms", defaults.retry_backoff_ms)?,
            statement_cache_capacity: parse_key(
                &config,
                "statement_cache_capacity",
                defaults.statement_cache_capacity,
            )?,
        })
    }

    /// Get the path to the SQLite database file
    pub fn sqlite_path(&self) -> PathBuf {
        Path::new(self.data_dir.trim_end_matches('/')).join(&self.database_name)
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Options for handles opened from this configuration
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            statement_cache_capacity: self.statement_cache_capacity,
            lock_policy: self.lock_policy(),
            ..OpenOptions::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            with_sqlite: self.with_sqlite,
            options: self.open_options(),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Data Directory:     {}", self.data_dir),
            format!("SQLite Path:        {}", self.sqlite_path().display()),
            format!(
                "SQL Engine:         {}",
                if self.with_sqlite { "enabled" } else { "disabled" }
            ),
            format!("Busy Timeout:       {} ms", self.busy_timeout_ms),
            format!("Lock Timeout:       {} ms", self.lock_timeout_ms),
            format!(
                "Retries:            {} (backoff {} ms)",
                self.max_retries, self.retry_backoff_ms
            ),
            format!("Statement Cache:    {}", self.statement_cache_capacity),
        ];

        let sqlite_path = self.sqlite_path();
        if let Ok(meta) = std::fs::metadata(&sqlite_path) {
            lines.push(format!("Database Size:      {} bytes", meta.len()));
        } else {
            lines.push("Database Size:      (not created yet)".to_string());
        }

        lines.join("\n")
    }

    /// Get the default config file path
    pub fn config_file_path() -> String {
        let base = dirs::config_dir()
            .or_else(dirs::home_dir)
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/dataaccess/dataaccess.toml", base.trim_end_matches('/'))
    }
}

fn expand_home(dir: &str) -> String {
    match (dir.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => dir.to_string(),
    }
}
