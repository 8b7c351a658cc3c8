//! Configuration for the cache facade and the retry proxy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryStrategy;

/// Tag records are kept alive at least this long (seconds) when a finite
/// tags lifetime is derived from `default_lifetime`.
const MIN_TAGS_LIFETIME_BASE: u64 = 28_800;

/// Cache facade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Key prefix partition shared by item and tag records.
    /// Must match `[-+_.A-Za-z0-9]*`.
    pub namespace: String,

    /// Default item lifetime in seconds, applied when an item carries no
    /// explicit expiry. `0` means "no default expiry" and also disables
    /// the tag-record TTL.
    pub default_lifetime: u64,

    /// Wall-clock window (milliseconds) during which tag versions read by
    /// one operation may be reused by the next. `0` means one-shot reuse.
    pub known_tag_versions_ttl_ms: u64,

    /// Retry proxy configuration.
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            default_lifetime: 0,
            known_tag_versions_ttl_ms: 150,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Derived TTL for tag records.
    ///
    /// `None` (tags never expire) when `default_lifetime` is zero, else
    /// three times the default lifetime with a floor that keeps every
    /// finite tags lifetime at or above one day.
    pub fn tags_lifetime(&self) -> Option<Duration> {
        if self.default_lifetime == 0 {
            return None;
        }
        let base = self.default_lifetime.max(MIN_TAGS_LIFETIME_BASE);
        Some(Duration::from_secs(base * 3))
    }

    /// Memo window for recently read tag versions.
    pub fn known_tag_versions_ttl(&self) -> Duration {
        Duration::from_millis(self.known_tag_versions_ttl_ms)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Retry proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total retry budget in milliseconds. The sum of sleeps for one read
    /// never exceeds this.
    pub timeout_ms: u64,

    /// Maximum number of re-reads after the initial miss.
    pub max_retries: u32,

    /// Interval distribution strategy.
    pub strategy: RetryStrategy,

    /// Strategy parameter: geometric growth factor, or the expected retry
    /// count for the binomial strategy.
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 4,
            strategy: RetryStrategy::FlatGeometricIntervals,
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry budget as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
