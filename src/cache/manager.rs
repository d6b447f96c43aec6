// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single facade over the ordered list of local tiers.
//!
//! Tier failures stop here: they are logged and counted, never returned.
//! A degraded cache must not block the caller, the remote store stays the
//! source of truth.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::record::{FlightRecord, SCHEMA_VERSION};
use crate::storage::traits::{CacheBackend, StorageError, TierKind, TierMetadata};

/// Status of one tier for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier: TierKind,
    pub exists: bool,
    pub count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub expired: bool,
    /// Stored under another schema version; read as a miss
    pub outdated_schema: bool,
    pub size_bytes: Option<u64>,
    /// Gave up on this tier after a quota failure
    pub abandoned: bool,
    /// Missed the latest write; not read until the next successful store
    pub stale: bool,
}

impl TierStatus {
    fn missing(tier: TierKind, abandoned: bool) -> Self {
        Self {
            tier,
            exists: false,
            count: 0,
            last_updated: None,
            expiry: None,
            expired: false,
            outdated_schema: false,
            size_bytes: None,
            abandoned,
            stale: false,
        }
    }

    fn from_metadata(tier: TierKind, meta: TierMetadata, ttl: TimeDelta, now: DateTime<Utc>, abandoned: bool) -> Self {
        let expiry = meta.last_updated + ttl;
        Self {
            tier,
            exists: true,
            count: meta.record_count,
            last_updated: Some(meta.last_updated),
            expiry: Some(expiry),
            expired: now > expiry,
            outdated_schema: meta.schema_version != SCHEMA_VERSION,
            size_bytes: meta.size_bytes,
            abandoned,
            stale: false,
        }
    }

    /// Holds non-empty, unexpired data in the current schema that is not
    /// older than the last accepted write.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.exists && self.count > 0 && !self.expired && !self.outdated_schema && !self.stale
    }
}

/// Per-tier status for one user, in preference order.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub user_id: String,
    pub tiers: Vec<TierStatus>,
}

impl CacheReport {
    #[must_use]
    pub fn tier(&self, kind: TierKind) -> Option<&TierStatus> {
        self.tiers.iter().find(|t| t.tier == kind)
    }

    /// First tier holding valid data.
    #[must_use]
    pub fn primary(&self) -> Option<TierKind> {
        self.tiers.iter().find(|t| t.is_valid()).map(|t| t.tier)
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache status for {}", self.user_id)?;
        for t in &self.tiers {
            let marker = if t.is_valid() { "+" } else if t.exists { "~" } else { "-" };
            let ts = |v: Option<DateTime<Utc>>| v.map_or_else(|| "N/A".to_string(), |d| d.to_rfc3339());
            writeln!(
                f,
                "{} {:<8} records={:<5} size={:<8} updated={} expires={}{}{}{}",
                marker,
                t.tier,
                t.count,
                t.size_bytes.map_or_else(|| "N/A".to_string(), format_bytes),
                ts(t.last_updated),
                ts(t.expiry),
                if t.outdated_schema { " [outdated schema]" } else { "" },
                if t.abandoned { " [abandoned]" } else { "" },
                if t.stale { " [stale]" } else { "" },
            )?;
        }
        Ok(())
    }
}

/// Outcome of one maintenance pass for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_cleared: Vec<TierKind>,
    pub optimized_out: Vec<TierKind>,
}

/// Human-readable byte size: `0KB`, `512B`, `1.5KB`, `2MB`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0KB".to_string();
    }
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let text = format!("{:.2}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", text, UNITS[unit])
}

pub struct CacheManager {
    tiers: Vec<Arc<dyn CacheBackend>>,
    ttl: TimeDelta,
    abandoned: DashSet<(TierKind, String)>,
    stale: DashSet<(TierKind, String)>,
}

impl CacheManager {
    /// Tiers are kept in preference order (see [`TierKind`]) regardless of
    /// the order given.
    pub fn new(mut tiers: Vec<Arc<dyn CacheBackend>>, ttl: TimeDelta) -> Self {
        tiers.sort_by_key(|t| t.kind());
        Self {
            tiers,
            ttl,
            abandoned: DashSet::new(),
            stale: DashSet::new(),
        }
    }

    pub fn tiers(&self) -> &[Arc<dyn CacheBackend>] {
        &self.tiers
    }

    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn is_abandoned(&self, kind: TierKind, user_id: &str) -> bool {
        self.abandoned.contains(&(kind, user_id.to_string()))
    }

    fn is_stale(&self, kind: TierKind, user_id: &str) -> bool {
        self.stale.contains(&(kind, user_id.to_string()))
    }

    pub async fn get_status(&self, user_id: &str) -> CacheReport {
        let now = Utc::now();
        let mut statuses = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            let kind = tier.kind();
            let abandoned = self.is_abandoned(kind, user_id);
            let mut status = match tier.metadata(user_id).await {
                Ok(Some(meta)) => TierStatus::from_metadata(kind, meta, self.ttl, now, abandoned),
                Ok(None) => TierStatus::missing(kind, abandoned),
                Err(e) => {
                    warn!(tier = %kind, user_id = %user_id, error = %e, "Tier status unavailable");
                    metrics::record_operation(tier_label(kind), "metadata", "error");
                    TierStatus::missing(kind, abandoned)
                }
            };
            status.stale = self.is_stale(kind, user_id);
            metrics::set_tier_records(tier_label(kind), status.count);
            statuses.push(status);
        }
        CacheReport {
            user_id: user_id.to_string(),
            tiers: statuses,
        }
    }

    /// Write the full set through to every tier still in use for the user.
    /// Returns how many tiers accepted it.
    ///
    /// When at least one tier accepts, every tier that did not is cleared for
    /// the user and marked stale, so reads and maintenance never prefer an
    /// older set over the one just written. When none accepts, the previous
    /// copies stay readable as the last offline copy.
    #[tracing::instrument(skip(self, records), fields(records = records.len()))]
    pub async fn store(&self, user_id: &str, records: &[FlightRecord]) -> usize {
        let mut accepted = 0;
        let mut missed = Vec::new();
        for tier in &self.tiers {
            let kind = tier.kind();
            if self.is_abandoned(kind, user_id) {
                debug!(tier = %kind, "Skipping abandoned tier");
                missed.push(kind);
                continue;
            }
            let _timer = metrics::LatencyTimer::new(tier_label(kind), "store");
            match tier.store(user_id, records).await {
                Ok(()) => {
                    accepted += 1;
                    self.stale.remove(&(kind, user_id.to_string()));
                    metrics::record_operation(tier_label(kind), "store", "success");
                }
                Err(StorageError::QuotaExceeded { needed, available, .. }) => {
                    warn!(
                        tier = %kind,
                        user_id = %user_id,
                        needed,
                        available,
                        "Tier quota exhausted, abandoning tier for this user"
                    );
                    self.abandoned.insert((kind, user_id.to_string()));
                    metrics::record_tier_abandoned(tier_label(kind));
                    missed.push(kind);
                }
                Err(e) => {
                    warn!(tier = %kind, user_id = %user_id, error = %e, "Tier store failed");
                    metrics::record_operation(tier_label(kind), "store", "error");
                    missed.push(kind);
                }
            }
        }

        if accepted > 0 {
            for kind in missed {
                if self.stale.insert((kind, user_id.to_string())) {
                    debug!(tier = %kind, user_id = %user_id, "Tier missed a write, marked stale");
                }
                self.clear_tier(kind, user_id).await;
            }
        }
        accepted
    }

    /// Records from the first tier that has any, with the tier they came from.
    /// Expiry is ignored. Outdated-schema tiers are cleared and skipped, as
    /// are tiers that missed the latest write.
    pub async fn load_with_source(&self, user_id: &str) -> Option<(TierKind, Vec<FlightRecord>)> {
        for tier in &self.tiers {
            let kind = tier.kind();
            if self.is_stale(kind, user_id) {
                continue;
            }
            match tier.load(user_id).await {
                Ok(records) if !records.is_empty() => {
                    metrics::record_operation(tier_label(kind), "load", "success");
                    return Some((kind, records));
                }
                Ok(_) => continue,
                Err(StorageError::SchemaMismatch { found, expected, .. }) => {
                    warn!(tier = %kind, found, expected, "Outdated tier schema, clearing for rebuild");
                    metrics::record_schema_rebuild(tier_label(kind));
                    if let Err(e) = tier.clear(user_id).await {
                        warn!(tier = %kind, error = %e, "Failed to clear outdated tier");
                    }
                }
                Err(e) => {
                    warn!(tier = %kind, user_id = %user_id, error = %e, "Tier load failed, trying next");
                    metrics::record_operation(tier_label(kind), "load", "error");
                }
            }
        }
        None
    }

    pub async fn load(&self, user_id: &str) -> Vec<FlightRecord> {
        self.load_with_source(user_id)
            .await
            .map(|(_, records)| records)
            .unwrap_or_default()
    }

    /// Clear tiers past their expiry, but only while some other tier still
    /// holds valid data. The last offline copy is never deleted.
    pub async fn cleanup_expired(&self, user_id: &str) -> Vec<TierKind> {
        let report = self.get_status(user_id).await;
        let mut cleared = Vec::new();

        for status in report.tiers.iter().filter(|s| s.exists && s.expired) {
            let fresher = report
                .tiers
                .iter()
                .any(|other| other.tier != status.tier && other.is_valid());
            if !fresher {
                info!(tier = %status.tier, user_id = %user_id, "Expired tier kept: no fresher copy");
                continue;
            }
            if self.clear_tier(status.tier, user_id).await {
                metrics::record_tier_evicted(tier_label(status.tier), "expired");
                cleared.push(status.tier);
            }
        }

        if !cleared.is_empty() {
            info!(user_id = %user_id, cleared = ?cleared, "Expired tiers cleaned up");
        }
        cleared
    }

    /// Once the most preferred tier holds valid data, drop the copies in
    /// every lower tier.
    pub async fn optimize(&self, user_id: &str) -> Vec<TierKind> {
        let report = self.get_status(user_id).await;
        let Some(primary) = report.primary() else {
            debug!(user_id = %user_id, "No valid tier, nothing to optimize");
            return Vec::new();
        };

        let mut evicted = Vec::new();
        for status in report.tiers.iter().filter(|s| s.tier > primary && s.exists) {
            if self.clear_tier(status.tier, user_id).await {
                metrics::record_tier_evicted(tier_label(status.tier), "redundant");
                evicted.push(status.tier);
            }
        }

        if !evicted.is_empty() {
            info!(user_id = %user_id, primary = %primary, evicted = ?evicted, "Redundant tiers evicted");
        }
        evicted
    }

    pub async fn maintain(&self, user_id: &str) -> MaintenanceReport {
        MaintenanceReport {
            expired_cleared: self.cleanup_expired(user_id).await,
            optimized_out: self.optimize(user_id).await,
        }
    }

    /// Clear every tier for the user (logout, explicit clear). Also forgets
    /// abandoned and stale tiers so the next session tries them again.
    pub async fn clear_all(&self, user_id: &str) {
        for tier in &self.tiers {
            self.clear_tier(tier.kind(), user_id).await;
            self.abandoned.remove(&(tier.kind(), user_id.to_string()));
            self.stale.remove(&(tier.kind(), user_id.to_string()));
        }
        info!(user_id = %user_id, "All cache tiers cleared");
    }

    /// Run [`maintain`](Self::maintain) for every user in `users` on a fixed
    /// interval until `shutdown` flips to true. The set is read on each tick.
    pub async fn run_maintenance(
        &self,
        users: Arc<DashSet<String>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot: Vec<String> = users.iter().map(|u| u.key().clone()).collect();
                    for user_id in &snapshot {
                        let report = self.maintain(user_id).await;
                        debug!(user_id = %user_id, ?report, "Cache maintenance pass");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Cache maintenance stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn clear_tier(&self, kind: TierKind, user_id: &str) -> bool {
        let Some(tier) = self.tiers.iter().find(|t| t.kind() == kind) else {
            return false;
        };
        match tier.clear(user_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tier = %kind, user_id = %user_id, error = %e, "Tier clear failed");
                metrics::record_operation(tier_label(kind), "clear", "error");
                false
            }
        }
    }
}

fn tier_label(kind: TierKind) -> &'static str {
    match kind {
        TierKind::Indexed => "indexed",
        TierKind::QuotaLimited => "quota",
        TierKind::Volatile => "volatile",
    }
}
