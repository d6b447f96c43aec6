// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend for the indexed tier.
//!
//! Records are stored as JSON payloads next to the columns they are queried
//! by:
//!
//! ```sql
//! CREATE TABLE flight_records (
//!   user_id TEXT NOT NULL,
//!   id TEXT NOT NULL,
//!   date TEXT NOT NULL,          -- YYYY-MM-DD
//!   year INTEGER NOT NULL,
//!   month INTEGER NOT NULL,
//!   airline TEXT NOT NULL,
//!   flight_number TEXT NOT NULL,
//!   version INTEGER NOT NULL,
//!   payload TEXT NOT NULL,       -- FlightRecord as JSON
//!   PRIMARY KEY (user_id, id)
//! )
//! CREATE TABLE tier_metadata (
//!   user_id TEXT PRIMARY KEY,
//!   record_count INTEGER NOT NULL,
//!   last_updated INTEGER NOT NULL,   -- epoch millis
//!   schema_version INTEGER NOT NULL
//! )
//! ```
//!
//! A full-set store runs delete + insert + metadata upsert in one
//! transaction, so readers see the old set until commit.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::traits::{CacheBackend, StorageError, TierKind, TierMetadata};
use crate::record::{FlightRecord, Period, SCHEMA_VERSION};
use crate::resilience::retry::{retry, RetryConfig};

pub struct SqlBackend {
    pool: SqlitePool,
}

impl SqlBackend {
    /// Open (or create) a database file, with startup-mode retry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);
        info!(path = %path_str, "Opening indexed tier");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let backend = Self { pool };
        backend.enable_wal_mode().await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Private in-memory database. One connection that never idles out,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = memory_pool().await?;
        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        const STATEMENTS: [&str; 4] = [
            r#"
            CREATE TABLE IF NOT EXISTS flight_records (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                date TEXT NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                airline TEXT NOT NULL,
                flight_number TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (user_id, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_flight_records_date ON flight_records (user_id, date)",
            "CREATE INDEX IF NOT EXISTS idx_flight_records_airline ON flight_records (user_id, airline)",
            r#"
            CREATE TABLE IF NOT EXISTS tier_metadata (
                user_id TEXT PRIMARY KEY,
                record_count INTEGER NOT NULL,
                last_updated INTEGER NOT NULL,
                schema_version INTEGER NOT NULL
            )
            "#,
        ];

        for sql in STATEMENTS {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    async fn check_schema(&self, user_id: &str) -> Result<(), StorageError> {
        let row = sqlx::query("SELECT schema_version FROM tier_metadata WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        if let Some(row) = row {
            let found: i64 = row.try_get("schema_version").map_err(backend_err)?;
            if found != i64::from(SCHEMA_VERSION) {
                return Err(StorageError::SchemaMismatch {
                    tier: TierKind::Indexed,
                    found: found as u32,
                    expected: SCHEMA_VERSION,
                });
            }
        }
        Ok(())
    }

    /// Records of one calendar month, ordered by date.
    pub async fn load_period(&self, user_id: &str, period: Period) -> Result<Vec<FlightRecord>, StorageError> {
        self.check_schema(user_id).await?;
        let rows = retry("sql_load_period", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT id, payload FROM flight_records WHERE user_id = ? AND year = ? AND month = ? ORDER BY date, id",
            )
            .bind(user_id)
            .bind(period.year)
            .bind(period.month as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Records operated by one airline, ordered by date.
    pub async fn load_by_airline(&self, user_id: &str, airline: &str) -> Result<Vec<FlightRecord>, StorageError> {
        self.check_schema(user_id).await?;
        let rows = retry("sql_load_airline", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT id, payload FROM flight_records WHERE user_id = ? AND airline = ? ORDER BY date, id",
            )
            .bind(user_id)
            .bind(airline)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        rows.iter().map(decode_row).collect()
    }
}

pub(crate) async fn memory_pool() -> Result<SqlitePool, StorageError> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn decode_row(row: &SqliteRow) -> Result<FlightRecord, StorageError> {
    let id: String = row.try_get("id").map_err(backend_err)?;
    let payload: String = row.try_get("payload").map_err(backend_err)?;
    serde_json::from_str(&payload).map_err(|e| StorageError::Corruption {
        key: id,
        reason: e.to_string(),
    })
}

#[async_trait]
impl CacheBackend for SqlBackend {
    fn kind(&self) -> TierKind {
        TierKind::Indexed
    }

    async fn store(&self, user_id: &str, records: &[FlightRecord]) -> Result<(), StorageError> {
        // rows are keyed by (user_id, id); a duplicate would silently replace
        let mut ids = HashSet::with_capacity(records.len());
        if let Some(dup) = records.iter().find(|r| !ids.insert(r.id.as_str())) {
            warn!(user_id = %user_id, record_id = %dup.id, "Refusing to store duplicate record id");
            return Err(StorageError::Corruption {
                key: user_id.to_string(),
                reason: format!("duplicate record id {}", dup.id),
            });
        }

        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            let payload = serde_json::to_string(record).map_err(|e| StorageError::Backend(e.to_string()))?;
            encoded.push((record, payload));
        }

        let count = retry("sql_store", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend_err)?;

            sqlx::query("DELETE FROM flight_records WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;

            for (record, payload) in &encoded {
                let period = record.period();
                sqlx::query(
                    "INSERT OR REPLACE INTO flight_records \
                     (user_id, id, date, year, month, airline, flight_number, version, payload) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(&record.id)
                .bind(record.date.to_string())
                .bind(period.year)
                .bind(period.month as i64)
                .bind(&record.airline)
                .bind(&record.flight_number)
                .bind(record.version as i64)
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            }

            let count: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM flight_records WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend_err)?
                .try_get("cnt")
                .map_err(backend_err)?;

            sqlx::query(
                "INSERT INTO tier_metadata (user_id, record_count, last_updated, schema_version) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id) DO UPDATE SET \
                    record_count = excluded.record_count, \
                    last_updated = excluded.last_updated, \
                    schema_version = excluded.schema_version",
            )
            .bind(user_id)
            .bind(count)
            .bind(Utc::now().timestamp_millis())
            .bind(i64::from(SCHEMA_VERSION))
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

            tx.commit().await.map_err(backend_err)?;
            Ok::<i64, StorageError>(count)
        })
        .await?;

        debug!(user_id = %user_id, records = count, "Indexed tier stored");
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<Vec<FlightRecord>, StorageError> {
        self.check_schema(user_id).await?;
        let rows = retry("sql_load", &RetryConfig::query(), || async {
            sqlx::query("SELECT id, payload FROM flight_records WHERE user_id = ? ORDER BY date, id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn clear(&self, user_id: &str) -> Result<(), StorageError> {
        retry("sql_clear", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend_err)?;
            sqlx::query("DELETE FROM flight_records WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            sqlx::query("DELETE FROM tier_metadata WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            tx.commit().await.map_err(backend_err)
        })
        .await
    }

    async fn metadata(&self, user_id: &str) -> Result<Option<TierMetadata>, StorageError> {
        let row = sqlx::query(
            "SELECT m.record_count, m.last_updated, m.schema_version, \
                (SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM flight_records r WHERE r.user_id = m.user_id) AS size_bytes \
             FROM tier_metadata m WHERE m.user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record_count: i64 = row.try_get("record_count").map_err(backend_err)?;
        let last_updated: i64 = row.try_get("last_updated").map_err(backend_err)?;
        let schema_version: i64 = row.try_get("schema_version").map_err(backend_err)?;
        let size_bytes: i64 = row.try_get("size_bytes").map_err(backend_err)?;

        let last_updated = DateTime::<Utc>::from_timestamp_millis(last_updated).ok_or_else(|| {
            StorageError::Corruption {
                key: format!("tier_metadata/{}", user_id),
                reason: format!("invalid timestamp {}", last_updated),
            }
        })?;

        Ok(Some(TierMetadata {
            record_count: record_count as usize,
            last_updated,
            schema_version: schema_version as u32,
            size_bytes: Some(size_bytes as u64),
        }))
    }
}
