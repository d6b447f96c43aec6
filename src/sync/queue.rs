// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable queue of local mutations waiting to reach the remote store.
//!
//! Entries live in SQLite so they survive restarts. Replay order is the
//! insertion order (`seq`), per user. An entry leaves the queue only once
//! the remote write succeeded or its conflict was resolved; failures just
//! bump `attempts`.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::record::FlightRecord;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::memory_pool;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

impl QueueOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation to enqueue.
///
/// `base_version` is the version of the record the mutation was made
/// against; replay flags a conflict when the remote moved past it.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub operation: QueueOperation,
    pub payload: FlightRecord,
    pub base_version: u64,
}

impl PendingOp {
    /// A new record the remote has never seen.
    #[must_use]
    pub fn create(payload: FlightRecord) -> Self {
        Self {
            operation: QueueOperation::Create,
            payload,
            base_version: 0,
        }
    }

    #[must_use]
    pub fn update(payload: FlightRecord, base_version: u64) -> Self {
        Self {
            operation: QueueOperation::Update,
            payload,
            base_version,
        }
    }

    /// `payload` is the last known copy, kept for its storage path.
    #[must_use]
    pub fn delete(payload: FlightRecord, base_version: u64) -> Self {
        Self {
            operation: QueueOperation::Delete,
            payload,
            base_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
    /// Insertion order; replay is ascending `seq`
    pub seq: i64,
    pub id: Uuid,
    pub user_id: String,
    pub operation: QueueOperation,
    pub record_id: String,
    pub payload: FlightRecord,
    pub base_version: u64,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Queue state for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    pub newest_queued_at: Option<DateTime<Utc>>,
    /// Highest attempt count among pending entries
    pub max_attempts: u32,
    /// Entries enqueued since this handle was opened
    pub total_enqueued: u64,
    /// Entries removed after replay since this handle was opened
    pub total_replayed: u64,
}

/// SQLite-persisted FIFO of [`SyncQueueEntry`].
pub struct SyncQueue {
    pool: SqlitePool,
    path: Option<String>,
    total_enqueued: AtomicU64,
    total_replayed: AtomicU64,
}

impl SyncQueue {
    /// Open (or create) the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);
        info!(path = %path_str, "Opening sync queue");

        let pool = retry("queue_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let queue = Self::with_pool(pool, Some(path_str));
        queue.init_schema().await?;

        let pending = queue.total_len().await?;
        if pending > 0 {
            warn!(pending, "Sync queue has entries from previous run, will replay");
        }
        Ok(queue)
    }

    /// Queue that lives only as long as the process.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let queue = Self::with_pool(memory_pool().await?, None);
        queue.init_schema().await?;
        Ok(queue)
    }

    fn with_pool(pool: SqlitePool, path: Option<String>) -> Self {
        Self {
            pool,
            path,
            total_enqueued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
        }
    }

    /// Database file backing the queue, `None` when in memory.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        const STATEMENTS: [&str; 2] = [
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                base_version INTEGER NOT NULL,
                queued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_user ON sync_queue (user_id, seq)",
        ];

        for sql in STATEMENTS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to init sync queue: {}", e)))?;
        }
        Ok(())
    }

    /// Append a mutation for `user_id`.
    pub async fn enqueue(&self, user_id: &str, op: PendingOp) -> Result<SyncQueueEntry, StorageError> {
        let id = Uuid::new_v4();
        let queued_at = Utc::now();
        let payload = serde_json::to_string(&op.payload).map_err(|e| StorageError::Backend(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO sync_queue (id, user_id, operation, record_id, payload, base_version, queued_at, attempts)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(user_id)
        .bind(op.operation.as_str())
        .bind(&op.payload.id)
        .bind(&payload)
        .bind(op.base_version as i64)
        .bind(queued_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        let seq = result.last_insert_rowid();
        debug!(
            user_id = %user_id,
            seq,
            operation = %op.operation,
            record_id = %op.payload.id,
            base_version = op.base_version,
            "Queued local change"
        );

        Ok(SyncQueueEntry {
            seq,
            id,
            user_id: user_id.to_string(),
            operation: op.operation,
            record_id: op.payload.id.clone(),
            payload: op.payload,
            base_version: op.base_version,
            // Round-trip through millis so the value matches a later read
            queued_at: from_millis(queued_at.timestamp_millis()),
            attempts: 0,
        })
    }

    /// Pending entries for `user_id` in replay order.
    pub async fn entries(&self, user_id: &str) -> Result<Vec<SyncQueueEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT seq, id, user_id, operation, record_id, payload, base_version, queued_at, attempts
             FROM sync_queue WHERE user_id = ? ORDER BY seq",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.iter().map(decode_entry).collect()
    }

    /// Remove replayed entries. Unknown seqs are ignored.
    pub async fn remove(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        if seqs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let mut removed = 0;
        for seq in seqs {
            let result = sqlx::query("DELETE FROM sync_queue WHERE seq = ?")
                .bind(seq)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(backend_err)?;

        self.total_replayed.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(removed, "Removed replayed queue entries");
        Ok(removed)
    }

    /// Note a failed replay attempt; the entry stays queued.
    pub async fn record_failure(&self, seq: i64) -> Result<u32, StorageError> {
        sqlx::query("UPDATE sync_queue SET attempts = attempts + 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        let row = sqlx::query("SELECT attempts FROM sync_queue WHERE seq = ?")
            .bind(seq)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        match row {
            Some(row) => {
                let attempts: i64 = row.try_get("attempts").map_err(backend_err)?;
                Ok(attempts as u32)
            }
            None => Ok(0),
        }
    }

    pub async fn len(&self, user_id: &str) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_queue WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let n: i64 = row.try_get("n").map_err(backend_err)?;
        Ok(n as usize)
    }

    pub async fn is_empty(&self, user_id: &str) -> Result<bool, StorageError> {
        Ok(self.len(user_id).await? == 0)
    }

    /// Pending entries across all users.
    pub async fn total_len(&self) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let n: i64 = row.try_get("n").map_err(backend_err)?;
        Ok(n as usize)
    }

    pub async fn status(&self, user_id: &str) -> Result<QueueStats, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, MIN(queued_at) AS oldest, MAX(queued_at) AS newest, MAX(attempts) AS max_attempts
             FROM sync_queue WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;

        let n: i64 = row.try_get("n").map_err(backend_err)?;
        let oldest: Option<i64> = row.try_get("oldest").map_err(backend_err)?;
        let newest: Option<i64> = row.try_get("newest").map_err(backend_err)?;
        let max_attempts: Option<i64> = row.try_get("max_attempts").map_err(backend_err)?;

        Ok(QueueStats {
            pending: n as usize,
            oldest_queued_at: oldest.map(from_millis),
            newest_queued_at: newest.map(from_millis),
            max_attempts: max_attempts.unwrap_or(0) as u32,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
        })
    }

    /// Drop every pending entry for `user_id`. Idempotent.
    pub async fn clear(&self, user_id: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        let cleared = result.rows_affected() as usize;
        if cleared > 0 {
            info!(user_id = %user_id, cleared, "Cleared sync queue");
        }
        Ok(cleared)
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn decode_entry(row: &SqliteRow) -> Result<SyncQueueEntry, StorageError> {
    let seq: i64 = row.try_get("seq").map_err(backend_err)?;
    let key = format!("sync_queue:{}", seq);
    let corrupt = |reason: String| StorageError::Corruption {
        key: key.clone(),
        reason,
    };

    let id: String = row.try_get("id").map_err(backend_err)?;
    let operation: String = row.try_get("operation").map_err(backend_err)?;
    let payload: String = row.try_get("payload").map_err(backend_err)?;
    let base_version: i64 = row.try_get("base_version").map_err(backend_err)?;
    let queued_at: i64 = row.try_get("queued_at").map_err(backend_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(backend_err)?;

    Ok(SyncQueueEntry {
        seq,
        id: Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?,
        user_id: row.try_get("user_id").map_err(backend_err)?,
        operation: QueueOperation::parse(&operation)
            .ok_or_else(|| corrupt(format!("unknown operation '{}'", operation)))?,
        record_id: row.try_get("record_id").map_err(backend_err)?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt(e.to_string()))?,
        base_version: base_version as u64,
        queued_at: from_millis(queued_at),
        attempts: attempts as u32,
    })
}
