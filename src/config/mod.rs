mod types;

pub use types::*;

use anyhow::{Context, Result};
use imagetiles_db::pool::{DbTarget, PoolOptions};
use imagetiles_db::store::StoreOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;
    expand_paths(&mut config);

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./imagetiles.toml",
        "~/.config/imagetiles/config.toml",
        "/etc/imagetiles/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

fn expand_paths(config: &mut Config) {
    let raw = config.database.path.to_string_lossy().into_owned();
    config.database.path = PathBuf::from(shellexpand::tilde(&raw).as_ref());
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.database.pool_size == 0 {
        anyhow::bail!("database.pool_size cannot be 0");
    }

    if config.database.list_page_size == 0 {
        anyhow::bail!("database.list_page_size cannot be 0");
    }

    if config.database.path.as_os_str().is_empty() {
        anyhow::bail!("database.path cannot be empty");
    }

    if config.logging.filter.trim().is_empty() {
        tracing::warn!("logging.filter is empty, nothing will be logged");
    }

    Ok(())
}

impl DatabaseConfig {
    pub fn target(&self) -> DbTarget {
        DbTarget::File(self.path.clone())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            pool: PoolOptions {
                max_size: self.pool_size,
                busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            },
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            list_page_size: self.list_page_size,
        }
    }
}
