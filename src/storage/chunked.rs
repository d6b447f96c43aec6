// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Quota-limited tier: chunked, compressed records in a small key/value area.
//!
//! Layout per user:
//!
//! ```text
//! fc:{user}:meta               -> Manifest (JSON): generation, chunk count, metadata
//! fc:{user}:g:{gen}:{index}    -> zstd(JSON [FlightRecord; <= chunk_size])
//! ```
//!
//! A store writes every chunk under a fresh generation, then flips the
//! manifest (a single key write), then sweeps the previous generation.
//! Until the flip, readers keep seeing the old set; a failed write removes
//! its partial generation and leaves the old manifest in place.
//!
//! On quota failure the store is retried once with the smaller fallback
//! chunk size. A second failure surfaces as [`StorageError::QuotaExceeded`];
//! the [`CacheManager`](crate::cache::CacheManager) decides what to do with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::{CacheBackend, StorageError, TierKind, TierMetadata};
use crate::compression::{decode_records, encode_records};
use crate::record::{FlightRecord, SCHEMA_VERSION};

/// A byte-quota key/value area (browser-style local storage, a small
/// directory, ...). `set` fails with `QuotaExceeded` instead of growing.
#[async_trait]
pub trait KvArea: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn used_bytes(&self) -> Result<usize, StorageError>;
    fn quota_bytes(&self) -> usize;
}

/// In-process area with a byte quota over keys plus values.
pub struct MemoryArea {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    quota_bytes: usize,
}

impl MemoryArea {
    #[must_use]
    pub fn new(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota_bytes,
        }
    }
}

#[async_trait]
impl KvArea for MemoryArea {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        let used: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        let replaced = entries.get(key).map_or(0, |v| key.len() + v.len());
        let needed = key.len() + value.len();
        let available = self.quota_bytes.saturating_sub(used - replaced);
        if needed > available {
            return Err(StorageError::QuotaExceeded {
                tier: TierKind::QuotaLimited,
                needed,
                available,
            });
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn used_bytes(&self) -> Result<usize, StorageError> {
        Ok(self.entries.lock().iter().map(|(k, v)| k.len() + v.len()).sum())
    }

    fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }
}

/// File-per-key area in a directory. File names are the hex-encoded keys;
/// each value is written to a temp file and renamed into place.
pub struct DirArea {
    dir: PathBuf,
    quota_bytes: usize,
}

impl DirArea {
    pub async fn open(dir: impl AsRef<Path>, quota_bytes: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::Backend(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir, quota_bytes })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }

    async fn file_sizes(&self) -> Result<Vec<(String, u64)>, StorageError> {
        let mut out = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            // temp files and foreign files are not keys
            let Some(key) = hex::decode(&name).ok().and_then(|b| String::from_utf8(b).ok()) else {
                continue;
            };
            let len = entry
                .metadata()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
                .len();
            out.push((key, len));
        }
        Ok(out)
    }
}

#[async_trait]
impl KvArea for DirArea {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let sizes = self.file_sizes().await?;
        let used: u64 = sizes.iter().map(|(_, len)| len).sum();
        let replaced = sizes
            .iter()
            .find(|(k, _)| k == key)
            .map_or(0, |(_, len)| *len);
        let available = (self.quota_bytes as u64).saturating_sub(used - replaced) as usize;
        if value.len() > available {
            return Err(StorageError::QuotaExceeded {
                tier: TierKind::QuotaLimited,
                needed: value.len(),
                available,
            });
        }

        let target = self.path_for(key);
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .file_sizes()
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn used_bytes(&self) -> Result<usize, StorageError> {
        Ok(self.file_sizes().await?.iter().map(|(_, len)| *len as usize).sum())
    }

    fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    generation: String,
    chunks: usize,
    chunk_size: usize,
    metadata: TierMetadata,
}

pub struct ChunkedBackend {
    area: Arc<dyn KvArea>,
    chunk_size: usize,
    fallback_chunk_size: usize,
}

impl ChunkedBackend {
    pub fn new(area: Arc<dyn KvArea>, chunk_size: usize, fallback_chunk_size: usize) -> Self {
        Self {
            area,
            chunk_size: chunk_size.max(1),
            fallback_chunk_size: fallback_chunk_size.max(1),
        }
    }

    /// In-memory area with the given quota and default chunk sizes (25 / 15).
    #[must_use]
    pub fn in_memory(quota_bytes: usize) -> Self {
        Self::new(Arc::new(MemoryArea::new(quota_bytes)), 25, 15)
    }

    pub fn area(&self) -> &Arc<dyn KvArea> {
        &self.area
    }

    fn meta_key(user_id: &str) -> String {
        format!("fc:{}:meta", user_id)
    }

    fn user_prefix(user_id: &str) -> String {
        format!("fc:{}:", user_id)
    }

    fn generation_prefix(user_id: &str) -> String {
        format!("fc:{}:g:", user_id)
    }

    fn chunk_key(user_id: &str, generation: &str, index: usize) -> String {
        format!("fc:{}:g:{}:{}", user_id, generation, index)
    }

    async fn read_manifest(&self, user_id: &str) -> Result<Option<Manifest>, StorageError> {
        let key = Self::meta_key(user_id);
        let Some(bytes) = self.area.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corruption { key, reason: e.to_string() })
    }

    async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.area.remove(key).await {
                warn!(key = %key, error = %e, "Failed to discard partial chunk");
            }
        }
    }

    async fn write_generation(
        &self,
        user_id: &str,
        records: &[FlightRecord],
        chunk_size: usize,
    ) -> Result<(), StorageError> {
        let generation = uuid::Uuid::new_v4().simple().to_string();
        let mut written: Vec<String> = Vec::new();
        let mut size_bytes = 0u64;

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            let key = Self::chunk_key(user_id, &generation, index);
            let bytes = match encode_records(chunk) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.discard(&written).await;
                    return Err(StorageError::Backend(e.to_string()));
                }
            };
            size_bytes += bytes.len() as u64;
            if let Err(e) = self.area.set(&key, bytes).await {
                self.discard(&written).await;
                return Err(e);
            }
            written.push(key);
        }

        let manifest = Manifest {
            generation: generation.clone(),
            chunks: written.len(),
            chunk_size,
            metadata: TierMetadata {
                record_count: records.len(),
                last_updated: Utc::now(),
                schema_version: SCHEMA_VERSION,
                size_bytes: Some(size_bytes),
            },
        };
        let manifest_bytes = match serde_json::to_vec(&manifest) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.discard(&written).await;
                return Err(StorageError::Backend(e.to_string()));
            }
        };
        if let Err(e) = self.area.set(&Self::meta_key(user_id), manifest_bytes).await {
            self.discard(&written).await;
            return Err(e);
        }

        self.sweep_stale_generations(user_id, &generation).await;
        debug!(
            user_id = %user_id,
            records = records.len(),
            chunks = written.len(),
            bytes = size_bytes,
            "Quota tier stored"
        );
        Ok(())
    }

    async fn sweep_stale_generations(&self, user_id: &str, current: &str) {
        let current_prefix = format!("{}{}:", Self::generation_prefix(user_id), current);
        match self.area.keys_with_prefix(&Self::generation_prefix(user_id)).await {
            Ok(keys) => {
                let stale: Vec<String> = keys
                    .into_iter()
                    .filter(|k| !k.starts_with(&current_prefix))
                    .collect();
                self.discard(&stale).await;
            }
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to list stale chunks"),
        }
    }
}

#[async_trait]
impl CacheBackend for ChunkedBackend {
    fn kind(&self) -> TierKind {
        TierKind::QuotaLimited
    }

    async fn store(&self, user_id: &str, records: &[FlightRecord]) -> Result<(), StorageError> {
        match self.write_generation(user_id, records, self.chunk_size).await {
            Err(StorageError::QuotaExceeded { needed, available, .. }) => {
                warn!(
                    user_id = %user_id,
                    needed,
                    available,
                    chunk_size = self.fallback_chunk_size,
                    "Quota exceeded, retrying with smaller chunks"
                );
                self.write_generation(user_id, records, self.fallback_chunk_size).await
            }
            other => other,
        }
    }

    async fn load(&self, user_id: &str) -> Result<Vec<FlightRecord>, StorageError> {
        let Some(manifest) = self.read_manifest(user_id).await? else {
            return Ok(Vec::new());
        };
        if manifest.metadata.schema_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                tier: TierKind::QuotaLimited,
                found: manifest.metadata.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        let mut records = Vec::with_capacity(manifest.metadata.record_count);
        for index in 0..manifest.chunks {
            let key = Self::chunk_key(user_id, &manifest.generation, index);
            let bytes = self.area.get(&key).await?.ok_or_else(|| StorageError::Corruption {
                key: key.clone(),
                reason: "chunk missing".to_string(),
            })?;
            let chunk = decode_records(&bytes).map_err(|e| StorageError::Corruption {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            records.extend(chunk);
        }

        if records.len() != manifest.metadata.record_count {
            return Err(StorageError::Corruption {
                key: Self::meta_key(user_id),
                reason: format!(
                    "manifest says {} records, chunks hold {}",
                    manifest.metadata.record_count,
                    records.len()
                ),
            });
        }
        Ok(records)
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        // manifest first: a half-cleared user then reads as empty
        self.area.remove(&Self::meta_key(user_id)).await?;
        for key in self.area.keys_with_prefix(&Self::user_prefix(user_id)).await? {
            self.area.remove(&key).await?;
        }
        Ok(())
    }

    async fn metadata(&self, user_id: &str) -> Result<Option<TierMetadata>, StorageError> {
        Ok(self.read_manifest(user_id).await?.map(|m| m.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn records(n: usize) -> Vec<FlightRecord> {
        (0..n)
            .map(|i| {
                let day = (i % 28) as u32 + 1;
                FlightRecord::new(
                    format!("f-{}", i),
                    format!("OZ{}", 100 + i),
                    NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
                )
                .with_route("ICN-NRT")
            })
            .collect()
    }

    /// Area that refuses any single value above a size limit.
    struct SmallValueArea {
        inner: MemoryArea,
        max_value: usize,
    }

    #[async_trait]
    impl KvArea for SmallValueArea {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
            if value.len() > self.max_value {
                return Err(StorageError::QuotaExceeded {
                    tier: TierKind::QuotaLimited,
                    needed: value.len(),
                    available: self.max_value,
                });
            }
            self.inner.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.keys_with_prefix(prefix).await
        }
        async fn used_bytes(&self) -> Result<usize, StorageError> {
            self.inner.used_bytes().await
        }
        fn quota_bytes(&self) -> usize {
            self.inner.quota_bytes()
        }
    }

    #[tokio::test]
    async fn test_store_and_load_roundtrip() {
        let backend = ChunkedBackend::in_memory(5 * 1024 * 1024);
        let input = records(60);
        backend.store("u1", &input).await.unwrap();

        let loaded = backend.load("u1").await.unwrap();
        assert_eq!(loaded, input);

        let meta = backend.metadata("u1").await.unwrap().unwrap();
        assert_eq!(meta.record_count, 60);
        assert!(meta.size_bytes.unwrap() > 0);

        // 60 records at 25 per chunk
        let chunks = backend.area().keys_with_prefix("fc:u1:g:").await.unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_sweeps_previous_generation() {
        let backend = ChunkedBackend::in_memory(5 * 1024 * 1024);
        backend.store("u1", &records(60)).await.unwrap();
        backend.store("u1", &records(10)).await.unwrap();

        let chunks = backend.area().keys_with_prefix("fc:u1:g:").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(backend.load("u1").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_empty_user_loads_empty() {
        let backend = ChunkedBackend::in_memory(1024);
        assert!(backend.load("ghost").await.unwrap().is_empty());
        assert!(backend.metadata("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_failure_keeps_previous_set() {
        let area = Arc::new(MemoryArea::new(4 * 1024));
        let backend = ChunkedBackend::new(area.clone(), 25, 15);

        let small = records(3);
        backend.store("u1", &small).await.unwrap();
        let used_before = area.used_bytes().await.unwrap();

        let result = backend.store("u1", &records(2000)).await;
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));

        // old set still visible, no partial chunks left behind
        assert_eq!(backend.load("u1").await.unwrap(), small);
        assert_eq!(area.used_bytes().await.unwrap(), used_before);
    }

    #[tokio::test]
    async fn test_quota_retry_with_smaller_chunks() {
        let one_chunk_of_15 = encode_records(&records(15)).unwrap().len();
        let one_chunk_of_25 = encode_records(&records(25)).unwrap().len();
        assert!(one_chunk_of_15 < one_chunk_of_25);

        let area = Arc::new(SmallValueArea {
            inner: MemoryArea::new(5 * 1024 * 1024),
            max_value: one_chunk_of_15 + (one_chunk_of_25 - one_chunk_of_15) / 2,
        });
        let backend = ChunkedBackend::new(area.clone(), 25, 15);

        backend.store("u1", &records(25)).await.unwrap();
        assert_eq!(backend.load("u1").await.unwrap().len(), 25);

        // stored with the fallback granularity: 15 + 10
        let chunks = area.keys_with_prefix("fc:u1:g:").await.unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_schema_mismatch_detected() {
        let area = Arc::new(MemoryArea::new(1024 * 1024));
        let backend = ChunkedBackend::new(area.clone(), 25, 15);
        backend.store("u1", &records(2)).await.unwrap();

        let raw = area.get("fc:u1:meta").await.unwrap().unwrap();
        let mut manifest: Manifest = serde_json::from_slice(&raw).unwrap();
        manifest.metadata.schema_version = SCHEMA_VERSION + 1;
        area.set("fc:u1:meta", serde_json::to_vec(&manifest).unwrap()).await.unwrap();

        let result = backend.load("u1").await;
        assert!(matches!(result, Err(StorageError::SchemaMismatch { .. })));
    }

    #[tokio::test]
    async fn test_corrupted_chunk_detected() {
        let area = Arc::new(MemoryArea::new(1024 * 1024));
        let backend = ChunkedBackend::new(area.clone(), 25, 15);
        backend.store("u1", &records(2)).await.unwrap();

        let chunk_key = area.keys_with_prefix("fc:u1:g:").await.unwrap().remove(0);
        area.set(&chunk_key, b"garbage".to_vec()).await.unwrap();

        let result = backend.load("u1").await;
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_clear_removes_everything_for_user() {
        let area = Arc::new(MemoryArea::new(1024 * 1024));
        let backend = ChunkedBackend::new(area.clone(), 25, 15);
        backend.store("u1", &records(30)).await.unwrap();
        backend.store("u2", &records(5)).await.unwrap();

        backend.clear("u1").await.unwrap();
        backend.clear("u1").await.unwrap();

        assert!(area.keys_with_prefix("fc:u1:").await.unwrap().is_empty());
        assert_eq!(backend.load("u2").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_dir_area_persists_across_instances() {
        let dir = tempdir().unwrap();
        let input = records(40);
        {
            let area = Arc::new(DirArea::open(dir.path(), 1024 * 1024).await.unwrap());
            let backend = ChunkedBackend::new(area, 25, 15);
            backend.store("u1", &input).await.unwrap();
        }

        let area = Arc::new(DirArea::open(dir.path(), 1024 * 1024).await.unwrap());
        let backend = ChunkedBackend::new(area.clone(), 25, 15);
        assert_eq!(backend.load("u1").await.unwrap(), input);
        assert!(area.used_bytes().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_dir_area_enforces_quota() {
        let dir = tempdir().unwrap();
        let area = DirArea::open(dir.path(), 16).await.unwrap();

        area.set("a", vec![0u8; 10]).await.unwrap();
        let result = area.set("b", vec![0u8; 10]).await;
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));

        // replacing an existing key only counts the difference
        area.set("a", vec![1u8; 16]).await.unwrap();
        assert_eq!(area.get("a").await.unwrap().unwrap().len(), 16);
    }
}
