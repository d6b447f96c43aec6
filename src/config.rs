//! Configuration for the flight sync engine.
//!
//! # Example
//!
//! ```
//! use flight_sync::FlightSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = FlightSyncConfig::default();
//! assert_eq!(config.cache_ttl_days, 7);
//! assert_eq!(config.chunk_size, 25);
//!
//! // On-disk tiers
//! let config = FlightSyncConfig {
//!     sqlite_path: Some("./flights.db".into()),
//!     queue_path: Some("./sync_queue.db".into()),
//!     remote_timeout_ms: 5_000,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

/// Configuration for the flight sync engine.
///
/// All fields have sensible defaults. Leaving the path fields unset keeps
/// every tier and the sync queue in memory, which is what tests want.
#[derive(Debug, Clone, Deserialize)]
pub struct FlightSyncConfig {
    /// Days before a tier's copy counts as stale (default: 7)
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: i64,

    /// Interval of the background cleanup/optimize pass (default: 7 days)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Bound on every remote call during sync (default: 10s)
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// Byte quota of the quota-limited tier (default: 5 MiB)
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: usize,

    /// Records per chunk in the quota-limited tier
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Smaller chunk size used for the single retry after a quota failure
    #[serde(default = "default_fallback_chunk_size")]
    pub fallback_chunk_size: usize,

    /// SQLite file for the indexed tier (None = in-memory database)
    #[serde(default)]
    pub sqlite_path: Option<String>,

    /// SQLite file for the sync queue (None = in-memory queue)
    #[serde(default)]
    pub queue_path: Option<String>,

    /// Directory for the quota-limited tier (None = in-memory area)
    #[serde(default)]
    pub quota_dir: Option<String>,

    /// Queue entries that failed this many times are logged at warn level
    #[serde(default = "default_slow_attempts_warn")]
    pub slow_attempts_warn: u32,
}

fn default_cache_ttl_days() -> i64 { 7 }
fn default_maintenance_interval_secs() -> u64 { 7 * 24 * 60 * 60 } // 7 days
fn default_remote_timeout_ms() -> u64 { 10_000 }
fn default_quota_bytes() -> usize { 5 * 1024 * 1024 } // 5 MiB
fn default_chunk_size() -> usize { 25 }
fn default_fallback_chunk_size() -> usize { 15 }
fn default_slow_attempts_warn() -> u32 { 3 }

impl Default for FlightSyncConfig {
    fn default() -> Self {
        Self {
            cache_ttl_days: default_cache_ttl_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            remote_timeout_ms: default_remote_timeout_ms(),
            quota_bytes: default_quota_bytes(),
            chunk_size: default_chunk_size(),
            fallback_chunk_size: default_fallback_chunk_size(),
            sqlite_path: None,
            queue_path: None,
            quota_dir: None,
            slow_attempts_warn: default_slow_attempts_warn(),
        }
    }
}

impl FlightSyncConfig {
    /// Cache TTL as a chrono delta (for timestamp arithmetic).
    #[must_use]
    pub fn cache_ttl(&self) -> TimeDelta {
        TimeDelta::days(self.cache_ttl_days)
    }

    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
