use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration for the fetch cache.
///
/// All durations deserialize from humantime strings (`"3s"`, `"24h"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory used for persisted records. Will be created if it does not
    /// exist.
    ///
    /// Leaving this as `None` disables the persistent layer entirely; the
    /// in-memory registry keeps working on its own.
    pub cache_dir: Option<PathBuf>,

    /// The TTL applied when a subscription does not specify one.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Hard floor below which caller-supplied TTLs are silently raised.
    ///
    /// Near-zero TTLs would turn every render into a cold fetch and defeat
    /// request coalescing.
    #[serde(with = "humantime_serde")]
    pub min_ttl: Duration,

    /// Retention for the cleanup sweep.
    ///
    /// Records older than this are removed by
    /// [`PersistentStore::cleanup`](crate::PersistentStore::cleanup) no
    /// matter what TTL their readers use. Lazy eviction on the read path is
    /// the correctness mechanism; the sweep only reclaims disk.
    #[serde(with = "humantime_serde")]
    pub max_record_age: Duration,

    /// Maximum number of entries kept in the in-memory registry.
    pub in_memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_ttl: Duration::from_secs(5 * 60),
            min_ttl: Duration::from_secs(3),
            max_record_age: Duration::from_secs(24 * 3600),
            in_memory_capacity: 10 * 1024,
        }
    }
}

impl CacheConfig {
    /// Loads the configuration from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open file {}", path.display()))?;
        serde_yaml::from_str(&source)
            .with_context(|| format!("failed to parse config YAML {}", path.display()))
    }

    /// Applies the default and the floor to a caller-supplied TTL.
    pub fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.default_ttl).max(self.min_ttl)
    }
}
