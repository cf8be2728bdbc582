use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite file holding image metadata (`~` is expanded)
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// How long `migrate` waits for another instance's migration lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Rows fetched per round trip when listing
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("imagetiles.db")
}

fn default_pool_size() -> u32 {
    4
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_list_page_size() -> u32 {
    100
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout(),
            lock_timeout_secs: default_lock_timeout(),
            list_page_size: default_list_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// tracing-subscriber filter used when RUST_LOG is unset and --verbose is off
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "imagetiles=info,imagetiles_db=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}
