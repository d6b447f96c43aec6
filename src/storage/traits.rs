use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::FlightRecord;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Quota exceeded on {tier}: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        tier: TierKind,
        needed: usize,
        available: usize,
    },
    #[error("Schema mismatch on {tier}: stored v{found}, expected v{expected}")]
    SchemaMismatch {
        tier: TierKind,
        found: u32,
        expected: u32,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
    },
}

/// Physical tier kind. Declaration order is the preference order:
/// the first kind holding valid data is primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TierKind {
    /// High-capacity, queryable by field (SQLite)
    Indexed,
    /// Small byte quota, chunked storage
    QuotaLimited,
    /// Process memory only
    Volatile,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexed => write!(f, "indexed"),
            Self::QuotaLimited => write!(f, "quota"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}

/// Per (tier, user) bookkeeping written alongside every full-set store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierMetadata {
    pub record_count: usize,
    pub last_updated: DateTime<Utc>,
    pub schema_version: u32,
    /// Bytes occupied, when the tier can measure it
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// One local storage tier.
///
/// Every tier owns its own namespace per user. A `store` replaces the full
/// set for the user and must look atomic: readers see either the old set or
/// the new one, never a mix. `load` ignores staleness entirely; the TTL only
/// decides whether to refresh, never whether data may be read.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn store(&self, user_id: &str, records: &[FlightRecord]) -> Result<(), StorageError>;

    /// All cached records for the user. Empty when nothing is cached.
    async fn load(&self, user_id: &str) -> Result<Vec<FlightRecord>, StorageError>;

    /// Idempotent.
    async fn clear(&self, user_id: &str) -> Result<(), StorageError>;

    async fn metadata(&self, user_id: &str) -> Result<Option<TierMetadata>, StorageError>;
}
