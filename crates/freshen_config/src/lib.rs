//! Parsing and validation of `freshen.toml` cache configuration.
//!
//! The only required setting is the base cache directory. Configuration is an
//! explicit value handed to each wrapped function; nothing here is global.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, CONFIG_FILE};
pub use types::CacheConfig;
