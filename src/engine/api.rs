//! Engine API: reads, local mutations, imports, sync and session cleanup.
//!
//! - `load_records()` - local read, remote only when no valid copy exists
//! - `refresh()` - pull the remote snapshot into the cache
//! - `update_status()` / `update_memo()` / `add_record()` / `delete_record()`
//! - `import_schedule()` - merge a parsed roster
//! - `sync_now()` - replay the queue
//! - `watch_remote()` - keep the cache current from remote change events
//! - `logout()` - drop everything local for the user

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheReport;
use crate::merge::{MergeChange, MergeEngine, MergeOptions, MergeOutcome};
use crate::record::{FlightRecord, FlightStatus};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::sync::{PendingOp, RemoteError, SyncError, SyncReport, SyncStatus};

use super::{overlay_pending, EngineError, EngineState, FlightSyncEngine, HealthCheck, Runtime};

impl FlightSyncEngine {
    /// Records for a user.
    ///
    /// Served from the cache whenever a valid copy exists, or when offline
    /// (stale data is still returned). Otherwise the remote snapshot is
    /// pulled and cached; if that fails the stale local copy is returned.
    #[tracing::instrument(skip(self))]
    pub async fn load_records(&self, user_id: &str) -> Result<Vec<FlightRecord>, EngineError> {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        self.load_locked(runtime, user_id).await
    }

    async fn load_locked(&self, runtime: &Runtime, user_id: &str) -> Result<Vec<FlightRecord>, EngineError> {
        self.users.insert(user_id.to_string());

        let status = runtime.cache.get_status(user_id).await;
        if status.primary().is_some() || !self.connectivity.is_online() {
            return Ok(runtime.cache.load(user_id).await);
        }

        // an expired copy is still a fallback, so one attempt is enough
        let has_fallback = status.tiers.iter().any(|t| t.exists && t.count > 0 && !t.stale);
        let retry = if has_fallback { RetryConfig::once() } else { RetryConfig::query() };
        match self.fetch_and_cache(runtime, user_id, &retry).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(error = %e, "Remote unavailable, serving local copy");
                Ok(runtime.cache.load(user_id).await)
            }
        }
    }

    /// Pull the remote snapshot, lay pending local changes over it and
    /// cache the result.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, user_id: &str) -> Result<Vec<FlightRecord>, EngineError> {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        self.fetch_and_cache(runtime, user_id, &RetryConfig::query()).await
    }

    async fn fetch_and_cache(
        &self,
        runtime: &Runtime,
        user_id: &str,
        retry: &RetryConfig,
    ) -> Result<Vec<FlightRecord>, EngineError> {
        if !self.connectivity.is_online() {
            return Err(EngineError::Offline);
        }

        let timeout = self.config.remote_timeout();
        let fetch = retry_when("remote_refresh", retry, RemoteError::is_transient, || async {
            self.remote.get(user_id).await
        });
        let remote = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => return Err(SyncError::Remote(e).into()),
            Err(_) => return Err(SyncError::NetworkTimeout(timeout).into()),
        };

        let pending = runtime.coordinator.queue().entries(user_id).await?;
        let records = overlay_pending(remote, &pending);
        runtime.cache.store(user_id, &records).await;
        debug!(records = records.len(), pending = pending.len(), "Cache refreshed from remote");
        Ok(records)
    }

    /// Set a record's departed/landed flags.
    pub async fn update_status(
        &self,
        user_id: &str,
        record_id: &str,
        status: FlightStatus,
    ) -> Result<FlightRecord, EngineError> {
        self.modify_record(user_id, record_id, |r| r.set_status(status)).await
    }

    pub async fn update_memo(
        &self,
        user_id: &str,
        record_id: &str,
        memo: Option<String>,
    ) -> Result<FlightRecord, EngineError> {
        self.modify_record(user_id, record_id, |r| r.set_memo(memo)).await
    }

    async fn modify_record<F>(&self, user_id: &str, record_id: &str, mutate: F) -> Result<FlightRecord, EngineError>
    where
        F: FnOnce(&mut FlightRecord),
    {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        let mut records = self.load_locked(runtime, user_id).await?;
        let Some(record) = records.iter_mut().find(|r| r.id == record_id) else {
            return Err(EngineError::RecordNotFound(record_id.to_string()));
        };

        let base_version = record.version;
        mutate(record);
        record.ensure_storage_path();
        let updated = record.clone();

        runtime.cache.store(user_id, &records).await;
        runtime
            .coordinator
            .queue()
            .enqueue(user_id, PendingOp::update(updated.clone(), base_version))
            .await?;
        debug!(record_id = %record_id, version = updated.version, "Local change queued");
        Ok(updated)
    }

    /// Add a single record created on this device. An empty id gets a
    /// fresh one.
    pub async fn add_record(&self, user_id: &str, mut record: FlightRecord) -> Result<FlightRecord, EngineError> {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        let mut records = self.load_locked(runtime, user_id).await?;

        if record.id.trim().is_empty() || records.iter().any(|r| r.id == record.id) {
            record.id = Uuid::new_v4().to_string();
        }
        record.version = 1;
        record.storage_path = None;
        record.ensure_storage_path();

        records.push(record.clone());
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        runtime.cache.store(user_id, &records).await;
        runtime
            .coordinator
            .queue()
            .enqueue(user_id, PendingOp::create(record.clone()))
            .await?;
        Ok(record)
    }

    pub async fn delete_record(&self, user_id: &str, record_id: &str) -> Result<(), EngineError> {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        let mut records = self.load_locked(runtime, user_id).await?;
        let Some(idx) = records.iter().position(|r| r.id == record_id) else {
            return Err(EngineError::RecordNotFound(record_id.to_string()));
        };

        let removed = records.remove(idx);
        runtime.cache.store(user_id, &records).await;
        let base_version = removed.version;
        runtime
            .coordinator
            .queue()
            .enqueue(user_id, PendingOp::delete(removed, base_version))
            .await?;
        Ok(())
    }

    /// Merge an imported roster into the user's records, cache the result
    /// and queue every resulting change.
    #[tracing::instrument(skip(self, imported), fields(imported = imported.len()))]
    pub async fn import_schedule(
        &self,
        user_id: &str,
        imported: &[FlightRecord],
        options: MergeOptions,
    ) -> Result<MergeOutcome, EngineError> {
        let runtime = self.runtime()?;
        let _writes = runtime.local_writes.lock().await;
        let existing = self.load_locked(runtime, user_id).await?;
        let outcome = MergeEngine::merge(&existing, imported, options)?;

        runtime.cache.store(user_id, &outcome.records).await;

        let queue = runtime.coordinator.queue();
        for change in &outcome.changes {
            let op = match change {
                MergeChange::Inserted(record) => PendingOp::create(record.clone()),
                MergeChange::Updated { record, base_version } => PendingOp::update(record.clone(), *base_version),
                MergeChange::Removed(record) => PendingOp::delete(record.clone(), record.version),
            };
            queue.enqueue(user_id, op).await?;
        }

        info!(
            changes = outcome.changes.len(),
            changed_dates = outcome.changed_dates.len(),
            "Schedule import applied"
        );
        Ok(outcome)
    }

    /// Replay the user's queue now and refresh the cache.
    pub async fn sync_now(&self, user_id: &str) -> Result<SyncReport, EngineError> {
        let runtime = self.runtime()?;
        if !self.connectivity.is_online() {
            return Err(EngineError::Offline);
        }
        self.users.insert(user_id.to_string());
        Ok(runtime.reconcile(user_id).await)
    }

    pub async fn sync_status(&self, user_id: &str) -> Result<SyncStatus, EngineError> {
        Ok(self.runtime()?.coordinator.status(user_id).await?)
    }

    pub async fn cache_status(&self, user_id: &str) -> Result<CacheReport, EngineError> {
        Ok(self.runtime()?.cache.get_status(user_id).await)
    }

    /// Keep the user's cache current from remote change events until
    /// [`unwatch_remote`](Self::unwatch_remote), logout or shutdown.
    pub fn watch_remote(&self, user_id: &str) -> Result<(), EngineError> {
        let runtime = self.runtime()?.clone();
        let handle = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let uid = user_id.to_string();

        let subscription = self.remote.subscribe(
            user_id,
            Arc::new(move |snapshot: &[FlightRecord]| {
                let runtime = runtime.clone();
                let uid = uid.clone();
                let snapshot = snapshot.to_vec();
                handle.spawn(async move {
                    let _writes = runtime.local_writes.lock().await;
                    match runtime.coordinator.queue().entries(&uid).await {
                        Ok(pending) => {
                            let records = overlay_pending(snapshot, &pending);
                            runtime.cache.store(&uid, &records).await;
                        }
                        Err(e) => warn!(user_id = %uid, error = %e, "Queue unreadable, remote change not cached"),
                    }
                });
            }),
        );

        self.users.insert(user_id.to_string());
        self.subscriptions.lock().insert(user_id.to_string(), subscription);
        Ok(())
    }

    pub fn unwatch_remote(&self, user_id: &str) {
        self.subscriptions.lock().remove(user_id);
    }

    /// Drop all local state for the user: cache tiers, queued changes and
    /// the remote subscription. Unsynced changes are discarded.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self, user_id: &str) -> Result<(), EngineError> {
        let runtime = self.runtime()?;
        self.unwatch_remote(user_id);
        let _writes = runtime.local_writes.lock().await;
        runtime.cache.clear_all(user_id).await;
        let discarded = runtime.coordinator.clear_queue(user_id).await?;
        self.users.remove(user_id);
        info!(discarded, "User data cleared");
        Ok(())
    }

    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let online = self.connectivity.is_online();
        let (pending_entries, tiers, queue_ok) = match &self.runtime {
            Some(runtime) => {
                let pending = runtime.coordinator.queue().total_len().await;
                let tiers = runtime.cache.tiers().iter().map(|t| t.kind()).collect();
                (pending.as_ref().copied().unwrap_or(0), tiers, pending.is_ok())
            }
            None => (0, Vec::new(), false),
        };

        HealthCheck {
            state,
            online,
            active_users: self.users.len(),
            pending_entries,
            tiers,
            healthy: state == EngineState::Running && queue_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightSyncConfig;
    use crate::sync::{InMemoryRecordStore, RecordStore};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn record(id: &str, d: u32) -> FlightRecord {
        FlightRecord::new(id, "OZ521", NaiveDate::from_ymd_opt(2025, 11, d).unwrap()).with_route("ICN-FRA")
    }

    async fn running(remote: &InMemoryRecordStore) -> FlightSyncEngine {
        let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
        engine.start().await.unwrap();
        engine
    }

    async fn seed(remote: &InMemoryRecordStore, user: &str, records: &[FlightRecord]) {
        for r in records {
            remote.put(user, r, &r.resolved_storage_path()).await.unwrap();
        }
    }

    /// Counts snapshot reads.
    struct CountingStore {
        inner: InMemoryRecordStore,
        gets: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RecordStore for CountingStore {
        async fn get(&self, user_id: &str) -> Result<Vec<FlightRecord>, RemoteError> {
            self.gets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.get(user_id).await
        }
        async fn put(
            &self,
            user_id: &str,
            record: &FlightRecord,
            path: &crate::record::StoragePath,
        ) -> Result<(), RemoteError> {
            self.inner.put(user_id, record, path).await
        }
        async fn delete(
            &self,
            user_id: &str,
            record_id: &str,
            path: &crate::record::StoragePath,
        ) -> Result<(), RemoteError> {
            self.inner.delete(user_id, record_id, path).await
        }
        fn subscribe(&self, user_id: &str, on_change: crate::sync::ChangeCallback) -> crate::sync::Subscription {
            self.inner.subscribe(user_id, on_change)
        }
    }

    #[tokio::test]
    async fn test_expired_copy_means_single_fetch_attempt() {
        use crate::storage::memory::InMemoryBackend;
        use crate::storage::traits::{CacheBackend, TierMetadata};
        use crate::sync::SyncQueue;
        use std::sync::atomic::Ordering;

        let inner = InMemoryRecordStore::new();
        seed(&inner, "u1", &[record("a", 1)]).await;
        let remote = Arc::new(CountingStore {
            inner: inner.clone(),
            gets: Default::default(),
        });
        let volatile = Arc::new(InMemoryBackend::new());
        let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), remote.clone());
        engine.start_with(
            vec![Arc::clone(&volatile) as Arc<dyn CacheBackend>],
            Arc::new(SyncQueue::in_memory().await.unwrap()),
        );
        engine.load_records("u1").await.unwrap();
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);

        let meta = volatile.metadata("u1").await.unwrap().unwrap();
        volatile.set_metadata(
            "u1",
            TierMetadata {
                last_updated: chrono::Utc::now() - chrono::TimeDelta::days(8),
                ..meta
            },
        );
        inner.set_offline(true);

        // stale copy served after one failed attempt
        assert_eq!(engine.load_records("u1").await.unwrap().len(), 1);
        assert_eq!(remote.gets.load(Ordering::SeqCst), 2);

        // an explicit refresh retries
        assert!(engine.refresh("u1").await.is_err());
        assert_eq!(remote.gets.load(Ordering::SeqCst), 5);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_running_rejects_calls() {
        let engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(InMemoryRecordStore::new()));
        assert!(matches!(
            engine.load_records("u1").await,
            Err(EngineError::NotRunning(EngineState::Created))
        ));
    }

    #[tokio::test]
    async fn test_first_load_pulls_remote_then_serves_cache() {
        let remote = InMemoryRecordStore::new();
        seed(&remote, "u1", &[record("a", 1), record("b", 2)]).await;
        let engine = running(&remote).await;

        assert_eq!(engine.load_records("u1").await.unwrap().len(), 2);

        // Cached now: remote outage does not matter
        remote.set_offline(true);
        assert_eq!(engine.load_records("u1").await.unwrap().len(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_update_queues_and_syncs() {
        let remote = InMemoryRecordStore::new();
        seed(&remote, "u1", &[record("a", 1)]).await;
        let engine = running(&remote).await;
        engine.load_records("u1").await.unwrap();

        let updated = engine
            .update_status("u1", "a", FlightStatus { departed: true, landed: false })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(engine.sync_status("u1").await.unwrap().pending_count, 1);

        let report = engine.sync_now("u1").await.unwrap();
        assert!(report.success, "{:?}", report.errors);
        assert!(remote.peek("u1", "a").unwrap().status.departed);
        assert_eq!(engine.sync_status("u1").await.unwrap().pending_count, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_record() {
        let remote = InMemoryRecordStore::new();
        let engine = running(&remote).await;
        let err = engine.update_memo("u1", "nope", None).await.unwrap_err();
        assert!(matches!(err, EngineError::RecordNotFound(id) if id == "nope"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_changes_replay_on_reconnect() {
        let remote = InMemoryRecordStore::new();
        seed(&remote, "u1", &[record("a", 1)]).await;
        let engine = running(&remote).await;
        engine.load_records("u1").await.unwrap();

        engine.set_online(false);
        assert!(matches!(engine.sync_now("u1").await, Err(EngineError::Offline)));
        engine.add_record("u1", record("", 5)).await.unwrap();
        engine.delete_record("u1", "a").await.unwrap();
        assert_eq!(engine.sync_status("u1").await.unwrap().pending_count, 2);

        engine.set_online(true);
        let queue = Arc::clone(engine.queue().unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_empty("u1").await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let remote_records = remote.get("u1").await.unwrap();
        assert_eq!(remote_records.len(), 1);
        assert_ne!(remote_records[0].id, "a");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_remote_updates_cache() {
        let remote = InMemoryRecordStore::new();
        let engine = running(&remote).await;
        engine.load_records("u1").await.unwrap();
        engine.watch_remote("u1").unwrap();

        seed(&remote, "u1", &[record("x", 9)]).await;
        let cache = Arc::clone(engine.cache().unwrap());
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.load("u1").await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.unwatch_remote("u1");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let remote = InMemoryRecordStore::new();
        seed(&remote, "u1", &[record("a", 1)]).await;
        let engine = running(&remote).await;
        engine.load_records("u1").await.unwrap();
        engine.update_memo("u1", "a", Some("hotel 1204".into())).await.unwrap();

        engine.logout("u1").await.unwrap();
        let report = engine.cache_status("u1").await.unwrap();
        assert!(report.tiers.iter().all(|t| !t.exists));
        assert_eq!(engine.sync_status("u1").await.unwrap().pending_count, 0);

        let health = engine.health_check().await;
        assert_eq!(health.active_users, 0);
        assert!(health.healthy);
        engine.shutdown().await;
    }
}
