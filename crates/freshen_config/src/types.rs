//! Configuration types deserialized from `freshen.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The on-disk layout of `freshen.toml`.
#[derive(Debug, Deserialize)]
pub(crate) struct ConfigFile {
    /// The `[cache]` table.
    pub cache: CacheConfig,
}

/// Settings shared by every function wrapped against the same cache.
///
/// ```toml
/// [cache]
/// dir = ".freshen-cache"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Base directory under which all cache entries are stored.
    #[serde(rename = "dir")]
    pub cache_dir: PathBuf,
}

impl CacheConfig {
    /// Creates a configuration rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Returns the base cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
