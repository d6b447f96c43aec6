// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue replay against the remote store.
//!
//! One pass per user at a time:
//!
//! ```text
//! fetch remote snapshot (bounded, quick retry)
//!   └─► replay queue FIFO
//!         ├─ remote moved past our base with other content → conflict, hold record
//!         ├─ write ok     → mark replayed
//!         └─ write failed → attempts + 1, hold record
//!   └─► resolve conflicts (handler or default) → write resolved, release held
//!   └─► remove replayed entries
//! ```
//!
//! Holding a record keeps its later entries queued too, so a record's
//! mutations always reach the remote in the order they were made.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::conflict::{ConflictHandler, ConflictInfo, DefaultResolution, ResolvedRecord};
use super::queue::{QueueOperation, SyncQueue, SyncQueueEntry};
use super::remote::{RecordStore, RemoteError};
use crate::config::FlightSyncConfig;
use crate::metrics;
use crate::record::FlightRecord;
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress for this user")]
    AlreadySyncing,
    #[error("Network timeout after {0:?}")]
    NetworkTimeout(Duration),
    #[error("Remote fetch failed: {0}")]
    Remote(#[source] RemoteError),
    #[error("Replay of '{record_id}' failed: {source}")]
    Replay {
        record_id: String,
        #[source]
        source: RemoteError,
    },
    #[error("Sync queue error: {0}")]
    Queue(#[from] StorageError),
    #[error("Queue entry {seq} has no record to replay")]
    MissingPayload { seq: i64 },
}

/// Outcome of one sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// No errors and no conflict left unresolved
    pub success: bool,
    /// Another pass for this user was running; nothing was done
    pub already_syncing: bool,
    /// Queue entries written to the remote store
    pub synced_count: usize,
    pub resolved_conflicts: usize,
    pub errors: Vec<SyncError>,
    /// Conflicts detected but not resolved; their entries stay queued
    pub conflicts: Vec<ConflictInfo>,
    /// The remote snapshot was fetched; `remote_records` is meaningful
    pub remote_fetched: bool,
    /// Remote snapshot with this pass's writes applied
    pub remote_records: Vec<FlightRecord>,
}

impl SyncReport {
    #[must_use]
    pub fn already_syncing() -> Self {
        Self {
            success: false,
            already_syncing: true,
            errors: vec![SyncError::AlreadySyncing],
            ..Default::default()
        }
    }

    fn outcome(&self) -> &'static str {
        if self.already_syncing {
            "already_syncing"
        } else if self.success {
            "success"
        } else if self.synced_count > 0 || self.resolved_conflicts > 0 {
            "partial"
        } else {
            "failed"
        }
    }
}

/// Queue and lock state for one user. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub oldest_queued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub newest_queued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_attempts: u32,
}

/// Releases the user's in-flight flag on drop, including early returns.
struct SyncGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    user_id: String,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.user_id);
    }
}

/// Per-pass bookkeeping.
#[derive(Default)]
struct Pass {
    remote: BTreeMap<String, FlightRecord>,
    /// Version this pass wrote per record
    written: HashMap<String, u64>,
    /// Records with a pending conflict, and their queued seqs
    held: HashMap<String, Vec<i64>>,
    /// Records whose replay failed; later entries wait for the next pass
    blocked: HashSet<String>,
    replayed: Vec<i64>,
    conflicts: Vec<ConflictInfo>,
}

pub struct SyncCoordinator {
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RecordStore>,
    timeout: Duration,
    fetch_retry: RetryConfig,
    slow_attempts_warn: u32,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncCoordinator {
    pub fn new(queue: Arc<SyncQueue>, remote: Arc<dyn RecordStore>) -> Self {
        Self {
            queue,
            remote,
            timeout: Duration::from_secs(10),
            fetch_retry: RetryConfig::query(),
            slow_attempts_warn: 3,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(queue: Arc<SyncQueue>, remote: Arc<dyn RecordStore>, config: &FlightSyncConfig) -> Self {
        Self::new(queue, remote)
            .with_timeout(config.remote_timeout())
            .with_slow_attempts_warn(config.slow_attempts_warn)
    }

    /// Bound for the snapshot fetch and for the whole replay.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fetch_retry(mut self, config: RetryConfig) -> Self {
        self.fetch_retry = config;
        self
    }

    #[must_use]
    pub fn with_slow_attempts_warn(mut self, attempts: u32) -> Self {
        self.slow_attempts_warn = attempts;
        self
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RecordStore> {
        &self.remote
    }

    #[must_use]
    pub fn is_syncing(&self, user_id: &str) -> bool {
        self.in_flight.lock().contains(user_id)
    }

    fn try_begin(&self, user_id: &str) -> Option<SyncGuard<'_>> {
        if !self.in_flight.lock().insert(user_id.to_string()) {
            return None;
        }
        Some(SyncGuard {
            in_flight: &self.in_flight,
            user_id: user_id.to_string(),
        })
    }

    /// Replay the user's queue against the remote store.
    ///
    /// `local_records` is the caller's current view, used as the local side
    /// of conflicts. Without a `handler`, conflicts get the default
    /// resolution.
    #[tracing::instrument(skip(self, local_records, handler))]
    pub async fn sync(
        &self,
        user_id: &str,
        local_records: &[FlightRecord],
        handler: Option<&dyn ConflictHandler>,
    ) -> SyncReport {
        let Some(_guard) = self.try_begin(user_id) else {
            debug!("Sync already running, skipping");
            metrics::record_sync_pass("already_syncing");
            return SyncReport::already_syncing();
        };

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut report = SyncReport::default();

        if let Err(e) = self.run_pass(user_id, local_records, handler, deadline, &mut report).await {
            warn!(error = %e, "Sync pass abandoned");
            report.errors.push(e);
        }

        report.success = report.errors.is_empty() && report.conflicts.is_empty();
        metrics::record_sync_pass(report.outcome());
        metrics::record_sync_duration(started.elapsed());
        if let Ok(depth) = self.queue.len(user_id).await {
            metrics::set_queue_depth(depth);
        }

        info!(
            success = report.success,
            synced = report.synced_count,
            resolved = report.resolved_conflicts,
            unresolved = report.conflicts.len(),
            errors = report.errors.len(),
            "Sync pass finished"
        );
        report
    }

    async fn run_pass(
        &self,
        user_id: &str,
        local_records: &[FlightRecord],
        handler: Option<&dyn ConflictHandler>,
        deadline: Instant,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let snapshot = self.fetch_remote(user_id).await?;
        report.remote_fetched = true;
        let entries = self.queue.entries(user_id).await?;
        debug!(remote = snapshot.len(), pending = entries.len(), "Starting replay");

        let mut pass = Pass {
            remote: snapshot.into_iter().map(|r| (r.id.clone(), r)).collect(),
            ..Default::default()
        };
        let local_by_id: HashMap<&str, &FlightRecord> =
            local_records.iter().map(|r| (r.id.as_str(), r)).collect();

        for (idx, entry) in entries.iter().enumerate() {
            // Entries are all-or-nothing: the deadline is only checked between them.
            if Instant::now() >= deadline {
                warn!(remaining = entries.len() - idx, "Sync deadline reached, leaving entries queued");
                report.errors.push(SyncError::NetworkTimeout(self.timeout));
                break;
            }
            self.replay_entry(user_id, entry, &local_by_id, &mut pass, report).await;
        }

        metrics::record_replayed(report.synced_count);

        if !pass.conflicts.is_empty() {
            let detected = pass.conflicts.len();
            let resolutions = match handler {
                Some(handler) => handler.resolve(&pass.conflicts).await,
                None => DefaultResolution.resolve(&pass.conflicts).await,
            };
            for resolution in resolutions {
                self.apply_resolution(user_id, resolution, &mut pass, report).await;
            }
            metrics::record_conflicts(detected, report.resolved_conflicts);
        }

        report.conflicts = std::mem::take(&mut pass.conflicts);
        report.remote_records = pass.remote.into_values().collect();
        report
            .remote_records
            .sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

        self.queue.remove(&pass.replayed).await?;
        Ok(())
    }

    async fn fetch_remote(&self, user_id: &str) -> Result<Vec<FlightRecord>, SyncError> {
        let fetch = retry_when("remote_fetch", &self.fetch_retry, RemoteError::is_transient, || async {
            self.remote.get(user_id).await
        });

        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(records)) => {
                metrics::record_operation("remote", "get", "success");
                Ok(records)
            }
            Ok(Err(RemoteError::Timeout(d))) => {
                metrics::record_operation("remote", "get", "error");
                Err(SyncError::NetworkTimeout(d))
            }
            Ok(Err(e)) => {
                metrics::record_operation("remote", "get", "error");
                Err(SyncError::Remote(e))
            }
            Err(_) => {
                metrics::record_operation("remote", "get", "error");
                Err(SyncError::NetworkTimeout(self.timeout))
            }
        }
    }

    async fn replay_entry(
        &self,
        user_id: &str,
        entry: &SyncQueueEntry,
        local_by_id: &HashMap<&str, &FlightRecord>,
        pass: &mut Pass,
        report: &mut SyncReport,
    ) {
        let record_id = entry.record_id.as_str();
        if record_id.is_empty() || entry.payload.id != record_id {
            report.errors.push(SyncError::MissingPayload { seq: entry.seq });
            self.note_failure(entry).await;
            return;
        }

        if let Some(seqs) = pass.held.get_mut(record_id) {
            seqs.push(entry.seq);
            return;
        }
        if pass.blocked.contains(record_id) {
            return;
        }

        let effective_base = entry
            .base_version
            .max(pass.written.get(record_id).copied().unwrap_or(0));

        if let Some(current) = pass.remote.get(record_id) {
            if current.version > effective_base
                && entry.operation != QueueOperation::Delete
                && current.same_content(&entry.payload)
            {
                // already on the remote at a newer version; writing would lower it
                debug!(
                    record_id = %record_id,
                    payload_version = entry.payload.version,
                    remote_version = current.version,
                    "Change already applied remotely"
                );
                pass.replayed.push(entry.seq);
                pass.written.insert(record_id.to_string(), current.version);
                report.synced_count += 1;
                return;
            }
            if current.version > effective_base && !current.same_content(&entry.payload) {
                let local = local_by_id
                    .get(record_id)
                    .map(|r| (*r).clone())
                    .unwrap_or_else(|| entry.payload.clone());
                let mut conflict = ConflictInfo::new(effective_base, local, current.clone());
                conflict.local_deleted = entry.operation == QueueOperation::Delete;

                info!(
                    record_id = %record_id,
                    base = effective_base,
                    remote_version = current.version,
                    "Version conflict"
                );
                pass.conflicts.push(conflict);
                pass.held.insert(record_id.to_string(), vec![entry.seq]);
                return;
            }
        }

        let path = entry.payload.resolved_storage_path();
        let result = match entry.operation {
            QueueOperation::Create | QueueOperation::Update => {
                self.remote.put(user_id, &entry.payload, &path).await
            }
            QueueOperation::Delete => self.remote.delete(user_id, record_id, &path).await,
        };

        match result {
            Ok(()) => {
                metrics::record_operation("remote", entry.operation.as_str(), "success");
                pass.replayed.push(entry.seq);
                pass.written.insert(record_id.to_string(), entry.payload.version);
                match entry.operation {
                    QueueOperation::Delete => {
                        pass.remote.remove(record_id);
                    }
                    _ => {
                        let mut written = entry.payload.clone();
                        written.storage_path = Some(path);
                        pass.remote.insert(record_id.to_string(), written);
                    }
                }
                report.synced_count += 1;
            }
            Err(source) => {
                metrics::record_operation("remote", entry.operation.as_str(), "error");
                self.note_failure(entry).await;
                pass.blocked.insert(record_id.to_string());
                report.errors.push(SyncError::Replay {
                    record_id: record_id.to_string(),
                    source,
                });
            }
        }
    }

    async fn note_failure(&self, entry: &SyncQueueEntry) {
        match self.queue.record_failure(entry.seq).await {
            Ok(attempts) if attempts >= self.slow_attempts_warn => warn!(
                seq = entry.seq,
                record_id = %entry.record_id,
                attempts,
                "Queue entry keeps failing"
            ),
            Ok(_) => {}
            Err(e) => warn!(seq = entry.seq, error = %e, "Failed to record replay failure"),
        }
    }

    async fn apply_resolution(
        &self,
        user_id: &str,
        resolution: ResolvedRecord,
        pass: &mut Pass,
        report: &mut SyncReport,
    ) {
        let Some(idx) = pass.conflicts.iter().position(|c| c.record_id == resolution.record_id) else {
            warn!(record_id = %resolution.record_id, "Resolution for unknown conflict ignored");
            return;
        };
        let conflict = &pass.conflicts[idx];

        let mut record = resolution.record;
        record.id = conflict.record_id.clone();
        record.version = record.version.max(conflict.resolved_version());
        let path = record.resolved_storage_path();

        // Keeping a local delete means deleting remotely.
        let delete = conflict.local_deleted && record.same_content(&conflict.local_record);
        let result = if delete {
            self.remote.delete(user_id, &record.id, &path).await
        } else {
            self.remote.put(user_id, &record, &path).await
        };

        match result {
            Ok(()) => {
                let conflict = pass.conflicts.remove(idx);
                if let Some(seqs) = pass.held.remove(&conflict.record_id) {
                    pass.replayed.extend(seqs);
                }
                if delete {
                    pass.remote.remove(&conflict.record_id);
                } else {
                    record.storage_path = Some(path);
                    pass.remote.insert(conflict.record_id.clone(), record);
                }
                report.resolved_conflicts += 1;
                debug!(record_id = %conflict.record_id, "Conflict resolved");
            }
            Err(source) => {
                report.errors.push(SyncError::Replay {
                    record_id: conflict.record_id.clone(),
                    source,
                });
            }
        }
    }

    pub async fn status(&self, user_id: &str) -> Result<SyncStatus, SyncError> {
        let stats = self.queue.status(user_id).await?;
        Ok(SyncStatus {
            pending_count: stats.pending,
            is_syncing: self.is_syncing(user_id),
            oldest_queued_at: stats.oldest_queued_at,
            newest_queued_at: stats.newest_queued_at,
            max_attempts: stats.max_attempts,
        })
    }

    /// Drop every pending entry for the user. Idempotent.
    pub async fn clear_queue(&self, user_id: &str) -> Result<usize, SyncError> {
        let cleared = self.queue.clear(user_id).await?;
        metrics::set_queue_depth(0);
        Ok(cleared)
    }
}
