//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::{CacheConfig, ConfigFile};
use std::path::Path;

/// Name of the configuration file looked up in a project directory.
pub const CONFIG_FILE: &str = "freshen.toml";

/// Loads and validates `freshen.toml` from a project directory.
///
/// A relative `cache.dir` is resolved against `project_dir`, so the cache
/// location does not depend on the process working directory.
pub fn load_config(project_dir: &Path) -> Result<CacheConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&config_path)?;
    let mut config = load_config_from_str(&content)?;
    if config.cache_dir.is_relative() {
        config.cache_dir = project_dir.join(&config.cache_dir);
    }
    Ok(config)
}

/// Parses and validates a `freshen.toml` configuration from a string.
///
/// Relative directories are returned unchanged.
pub fn load_config_from_str(content: &str) -> Result<CacheConfig, ConfigError> {
    let file: ConfigFile =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&file.cache)?;
    Ok(file.cache)
}

fn validate_config(config: &CacheConfig) -> Result<(), ConfigError> {
    if config.cache_dir.as_os_str().is_empty() {
        return Err(ConfigError::MissingField("cache.dir".to_string()));
    }
    Ok(())
}
