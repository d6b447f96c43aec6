//! Chaos testing for the flight sync engine.
//!
//! Failures are injected with wrappers around the real components:
//! 1. **FailingRecordStore** - remote writes fail at chosen call numbers
//! 2. **FailingTier** - a local tier that breaks on store or load
//! 3. **Lifecycle misuse** - double start, shutdown before start
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use flight_sync::storage::chunked::ChunkedBackend;
use flight_sync::storage::memory::InMemoryBackend;
use flight_sync::storage::sql::SqlBackend;
use flight_sync::storage::traits::TierMetadata;
use flight_sync::sync::{ChangeCallback, Subscription};
use flight_sync::{
    CacheBackend, CacheManager, EngineState, FlightRecord, FlightStatus, FlightSyncConfig, FlightSyncEngine,
    InMemoryRecordStore, PendingOp, RecordStore, RemoteError, RetryConfig, StorageError, StoragePath,
    SyncCoordinator, SyncError, SyncQueue, TierKind,
};

const USER: &str = "crew-0042";

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// Remote store whose writes (put and delete) fail on chosen call numbers.
/// Reads always go through.
#[allow(dead_code)]
pub struct FailingRecordStore {
    inner: InMemoryRecordStore,
    write_calls: AtomicU64,
    /// Fail on these write call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Permanent rejection instead of a transient outage
    reject: bool,
}

#[allow(dead_code)]
impl FailingRecordStore {
    pub fn new(inner: InMemoryRecordStore, fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner,
            write_calls: AtomicU64::new(0),
            fail_on_calls,
            reject: false,
        }
    }

    pub fn rejecting(inner: InMemoryRecordStore, fail_on_calls: Vec<u64>) -> Self {
        Self {
            reject: true,
            ..Self::new(inner, fail_on_calls)
        }
    }

    fn maybe_fail(&self) -> Result<(), RemoteError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.fail_on_calls.contains(&call) {
            return Ok(());
        }
        if self.reject {
            Err(RemoteError::Rejected(format!("write {call} rejected")))
        } else {
            Err(RemoteError::Unavailable(format!("write {call} dropped")))
        }
    }
}

#[async_trait]
impl RecordStore for FailingRecordStore {
    async fn get(&self, user_id: &str) -> Result<Vec<FlightRecord>, RemoteError> {
        self.inner.get(user_id).await
    }

    async fn put(&self, user_id: &str, record: &FlightRecord, path: &StoragePath) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.put(user_id, record, path).await
    }

    async fn delete(&self, user_id: &str, record_id: &str, path: &StoragePath) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.delete(user_id, record_id, path).await
    }

    fn subscribe(&self, user_id: &str, callback: ChangeCallback) -> Subscription {
        self.inner.subscribe(user_id, callback)
    }
}

/// Local tier that can be broken at runtime.
pub struct FailingTier<B: CacheBackend> {
    inner: B,
    fail_store: AtomicBool,
    fail_load: AtomicBool,
}

impl<B: CacheBackend> FailingTier<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fail_store: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
        }
    }

    pub fn break_store(&self) {
        self.fail_store.store(true, Ordering::SeqCst);
    }

    pub fn break_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for FailingTier<B> {
    fn kind(&self) -> TierKind {
        self.inner.kind()
    }

    async fn store(&self, user_id: &str, records: &[FlightRecord]) -> Result<(), StorageError> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk I/O error".into()));
        }
        self.inner.store(user_id, records).await
    }

    async fn load(&self, user_id: &str) -> Result<Vec<FlightRecord>, StorageError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StorageError::Corruption {
                key: user_id.to_string(),
                reason: "page checksum mismatch".into(),
            });
        }
        self.inner.load(user_id).await
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        self.inner.clear(user_id).await
    }

    async fn metadata(&self, user_id: &str) -> Result<Option<TierMetadata>, StorageError> {
        self.inner.metadata(user_id).await
    }
}

fn flight(id: &str, d: u32) -> FlightRecord {
    FlightRecord::new(id, format!("KE{d:03}"), NaiveDate::from_ymd_opt(2025, 10, d).unwrap()).with_route("GMP-CJU")
}

async fn coordinator_over(remote: Arc<dyn RecordStore>) -> (Arc<SyncQueue>, SyncCoordinator) {
    let queue = Arc::new(SyncQueue::in_memory().await.unwrap());
    let coordinator = SyncCoordinator::new(Arc::clone(&queue), remote).with_fetch_retry(RetryConfig::once());
    (queue, coordinator)
}

// =============================================================================
// Remote Write Failures
// =============================================================================

#[tokio::test]
async fn chaos_write_fails_mid_replay() {
    let inner = InMemoryRecordStore::new();
    let remote = Arc::new(FailingRecordStore::new(inner.clone(), vec![2]));
    let (queue, coordinator) = coordinator_over(remote).await;
    for d in 1..=3 {
        queue.enqueue(USER, PendingOp::create(flight(&format!("f{d}"), d))).await.unwrap();
    }

    let report = coordinator.sync(USER, &[], None).await;
    assert!(!report.success);
    assert_eq!(report.synced_count, 2);
    assert!(matches!(
        &report.errors[..],
        [SyncError::Replay { record_id, source: RemoteError::Unavailable(_) }] if record_id == "f2"
    ));

    let left = queue.entries(USER).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].record_id, "f2");
    assert_eq!(left[0].attempts, 1);

    // Next pass picks it up
    let report = coordinator.sync(USER, &[], None).await;
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(inner.document_count(), 3);
    assert!(queue.is_empty(USER).await.unwrap());
}

#[tokio::test]
async fn chaos_failed_entry_holds_back_later_changes_to_same_record() {
    let inner = InMemoryRecordStore::new();
    let remote = Arc::new(FailingRecordStore::rejecting(inner.clone(), vec![1]));
    let (queue, coordinator) = coordinator_over(remote).await;

    let mut first = flight("f1", 4);
    queue.enqueue(USER, PendingOp::create(first.clone())).await.unwrap();
    first.touch();
    first.memo = Some("second edit".into());
    queue.enqueue(USER, PendingOp::update(first, 1)).await.unwrap();
    queue.enqueue(USER, PendingOp::create(flight("f2", 5))).await.unwrap();

    let report = coordinator.sync(USER, &[], None).await;
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.synced_count, 1);
    assert!(inner.peek(USER, "f1").is_none());
    assert!(inner.peek(USER, "f2").is_some());

    // Both f1 entries stay, in order
    let left = queue.entries(USER).await.unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|e| e.record_id == "f1"));
    assert!(left[0].seq < left[1].seq);
    assert_eq!(left[1].attempts, 0);

    let report = coordinator.sync(USER, &[], None).await;
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(inner.peek(USER, "f1").unwrap().memo.as_deref(), Some("second edit"));
}

#[tokio::test]
async fn chaos_attempts_accumulate_without_dropping_entry() {
    let inner = InMemoryRecordStore::new();
    let remote = Arc::new(FailingRecordStore::new(inner.clone(), vec![1, 2, 3, 4]));
    let (queue, coordinator) = coordinator_over(remote).await;
    let coordinator = coordinator.with_slow_attempts_warn(2);
    queue.enqueue(USER, PendingOp::create(flight("f1", 7))).await.unwrap();

    for _ in 0..4 {
        assert!(!coordinator.sync(USER, &[], None).await.success);
    }
    let status = coordinator.status(USER).await.unwrap();
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.max_attempts, 4);

    assert!(coordinator.sync(USER, &[], None).await.success);
    assert_eq!(coordinator.status(USER).await.unwrap().pending_count, 0);
}

// =============================================================================
// Local Tier Failures
// =============================================================================

#[tokio::test]
async fn chaos_broken_indexed_tier_falls_back() {
    let indexed = Arc::new(FailingTier::new(SqlBackend::in_memory().await.unwrap()));
    let quota = Arc::new(ChunkedBackend::in_memory(256 * 1024));
    let cache = CacheManager::new(
        vec![Arc::clone(&indexed) as Arc<dyn CacheBackend>, quota],
        chrono::TimeDelta::days(7),
    );
    let records: Vec<_> = (1..=5).map(|d| flight(&format!("f{d}"), d)).collect();

    assert_eq!(cache.store(USER, &records).await, 2);
    indexed.break_load();
    let (source, loaded) = cache.load_with_source(USER).await.unwrap();
    assert_eq!(source, TierKind::QuotaLimited);
    assert_eq!(loaded.len(), 5);

    indexed.break_store();
    assert_eq!(cache.store(USER, &records[..2]).await, 1);
}

#[tokio::test]
async fn chaos_failing_indexed_tier_keeps_offline_edits() {
    let remote = InMemoryRecordStore::new();
    let records: Vec<_> = (1..=4).map(|d| flight(&format!("f{d}"), d)).collect();
    for r in &records {
        remote.put(USER, r, &r.resolved_storage_path()).await.unwrap();
    }

    let indexed = Arc::new(FailingTier::new(SqlBackend::in_memory().await.unwrap()));
    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
    engine.start_with(
        vec![
            Arc::clone(&indexed) as Arc<dyn CacheBackend>,
            Arc::new(ChunkedBackend::in_memory(256 * 1024)),
        ],
        Arc::new(SyncQueue::in_memory().await.unwrap()),
    );
    assert_eq!(engine.load_records(USER).await.unwrap().len(), 4);

    indexed.break_store();
    engine.set_online(false);
    engine
        .update_status(USER, "f2", FlightStatus { departed: true, landed: false })
        .await
        .unwrap();

    let status = engine.cache_status(USER).await.unwrap();
    assert!(status.tier(TierKind::Indexed).unwrap().stale);
    assert_eq!(status.primary(), Some(TierKind::QuotaLimited));

    // Maintenance keeps the only fresh copy
    assert!(engine.cache().unwrap().optimize(USER).await.is_empty());

    // A later edit builds on the departed flag rather than reverting it
    engine.update_memo(USER, "f2", Some("gate change".into())).await.unwrap();
    let reloaded = engine.load_records(USER).await.unwrap();
    let f2 = reloaded.iter().find(|r| r.id == "f2").unwrap();
    assert!(f2.status.departed);
    assert_eq!(f2.memo.as_deref(), Some("gate change"));
    assert_eq!(engine.sync_status(USER).await.unwrap().pending_count, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_quota_exhaustion_is_silent() {
    let remote = InMemoryRecordStore::new();
    let records: Vec<_> = (1..=28).map(|d| flight(&format!("f{d}"), d)).collect();
    for r in &records {
        remote.put(USER, r, &r.resolved_storage_path()).await.unwrap();
    }

    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
    engine.start_with(
        vec![
            Arc::new(ChunkedBackend::in_memory(128)) as Arc<dyn CacheBackend>,
            Arc::new(InMemoryBackend::new()),
        ],
        Arc::new(SyncQueue::in_memory().await.unwrap()),
    );

    assert_eq!(engine.load_records(USER).await.unwrap().len(), 28);
    let status = engine.cache_status(USER).await.unwrap();
    assert!(status.tier(TierKind::QuotaLimited).unwrap().abandoned);
    assert_eq!(status.primary(), Some(TierKind::Volatile));

    // Later writes skip the abandoned tier and keep working
    engine.update_memo(USER, "f3", Some("deadhead".into())).await.unwrap();
    let reloaded = engine.load_records(USER).await.unwrap();
    assert_eq!(reloaded.iter().find(|r| r.id == "f3").unwrap().memo.as_deref(), Some("deadhead"));
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_every_tier_broken_still_queues_changes() {
    let remote = InMemoryRecordStore::new();
    let broken = Arc::new(FailingTier::new(InMemoryBackend::new()));
    broken.break_store();
    broken.break_load();

    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
    engine.start_with(
        vec![Arc::clone(&broken) as Arc<dyn CacheBackend>],
        Arc::new(SyncQueue::in_memory().await.unwrap()),
    );

    engine.add_record(USER, flight("", 9)).await.unwrap();
    assert_eq!(engine.sync_status(USER).await.unwrap().pending_count, 1);

    let report = engine.sync_now(USER).await.unwrap();
    assert!(report.success);
    assert_eq!(remote.document_count(), 1);
    engine.shutdown().await;
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_concurrent_edits_during_sync() {
    let remote = InMemoryRecordStore::new();
    let records: Vec<_> = (1..=12).map(|d| flight(&format!("f{d}"), d)).collect();
    for r in &records {
        remote.put(USER, r, &r.resolved_storage_path()).await.unwrap();
    }

    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(remote.clone()));
    engine.start().await.unwrap();
    engine.load_records(USER).await.unwrap();
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for d in 1..=12 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .update_memo(USER, &format!("f{d}"), Some(format!("memo {d}")))
                .await
                .unwrap();
        }));
    }
    let syncer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            for _ in 0..3 {
                let _ = engine.sync_now(USER).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };
    for h in handles {
        h.await.unwrap();
    }
    syncer.await.unwrap();

    // Every edit is visible locally, whatever interleaving happened
    let local = engine.load_records(USER).await.unwrap();
    for d in 1..=12 {
        let memo = local.iter().find(|r| r.id == format!("f{d}")).unwrap().memo.clone();
        assert_eq!(memo, Some(format!("memo {d}")));
    }

    let report = engine.sync_now(USER).await.unwrap();
    assert!(report.success, "{:?}", report.errors);
    for d in 1..=12 {
        assert_eq!(
            remote.peek(USER, &format!("f{d}")).unwrap().memo,
            Some(format!("memo {d}"))
        );
    }
    engine.shutdown().await;
}

// =============================================================================
// Lifecycle Misuse
// =============================================================================

#[tokio::test]
async fn chaos_double_start() {
    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(InMemoryRecordStore::new()));
    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running());
    assert_eq!(engine.cache().unwrap().tiers().len(), 3);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn chaos_shutdown_without_start() {
    let engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(InMemoryRecordStore::new()));
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Created);
}

#[tokio::test]
async fn chaos_restart_after_shutdown() {
    let mut engine = FlightSyncEngine::new(FlightSyncConfig::default(), Arc::new(InMemoryRecordStore::new()));
    engine.start().await.unwrap();
    engine.shutdown().await;
    engine.start().await.unwrap();
    assert!(engine.is_running());
    assert!(engine.load_records(USER).await.unwrap().is_empty());
    engine.shutdown().await;
}
