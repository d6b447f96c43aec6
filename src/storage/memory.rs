use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::traits::{CacheBackend, StorageError, TierKind, TierMetadata};
use crate::record::{FlightRecord, SCHEMA_VERSION};

struct Snapshot {
    records: Vec<FlightRecord>,
    metadata: TierMetadata,
}

/// Volatile tier: one snapshot per user, swapped wholesale on store.
pub struct InMemoryBackend {
    data: DashMap<String, Snapshot>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of users with cached data
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite the metadata of a user's snapshot (test helper for staleness).
    pub fn set_metadata(&self, user_id: &str, metadata: TierMetadata) {
        if let Some(mut snapshot) = self.data.get_mut(user_id) {
            snapshot.metadata = metadata;
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn kind(&self) -> TierKind {
        TierKind::Volatile
    }

    async fn store(&self, user_id: &str, records: &[FlightRecord]) -> Result<(), StorageError> {
        let snapshot = Snapshot {
            records: records.to_vec(),
            metadata: TierMetadata {
                record_count: records.len(),
                last_updated: Utc::now(),
                schema_version: SCHEMA_VERSION,
                size_bytes: None,
            },
        };
        self.data.insert(user_id.to_string(), snapshot);
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Vec<FlightRecord>, StorageError> {
        Ok(self
            .data
            .get(user_id)
            .map(|s| s.records.clone())
            .unwrap_or_default())
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        self.data.remove(user_id);
        Ok(())
    }

    async fn metadata(&self, user_id: &str) -> Result<Option<TierMetadata>, StorageError> {
        Ok(self.data.get(user_id).map(|s| s.metadata.clone()))
    }
}
