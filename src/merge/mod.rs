//! Schedule import merge.
//!
//! Reconciles an imported roster with the user's existing records, one
//! calendar month at a time:
//!
//! 1. group the batch by month
//! 2. pick the main month (see [`period::main_period`])
//! 3. per month, match records by natural key: schedule fields come from
//!    the import, user state (`status`, `memo`, `id`, storage path) is kept
//! 4. unmatched imports are inserted fresh; unmatched existing records are
//!    removed only for the main month of a non-supplementary batch
//!
//! Months the batch does not touch are passed through unchanged.
//!
//! # Example
//!
//! ```
//! use chrono::NaiveDate;
//! use flight_sync::merge::{MergeEngine, MergeOptions};
//! use flight_sync::FlightRecord;
//!
//! let day = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
//! let imported = vec![FlightRecord::new("", "KE123", day).with_route("ICN-NRT")];
//!
//! let outcome = MergeEngine::merge(&[], &imported, MergeOptions::default()).unwrap();
//! assert_eq!(outcome.summary.inserted, 1);
//! assert_eq!(outcome.changed_dates, vec![day]);
//! ```

pub mod period;
pub mod signature;
pub mod validate;

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics;
use crate::record::{FlightRecord, FlightStatus, NaturalKey, Period, StoragePath};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("Malformed import row {index}: {reason}")]
    MalformedImport { index: usize, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Delete existing records missing from the import. Only ever applied
    /// to the main month of a non-supplementary batch.
    #[serde(default)]
    pub remove_missing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub main_period: Option<Period>,
    /// Months present in the batch, chronological
    pub periods: Vec<Period>,
}

/// One record-level effect of a merge, for queueing remote writes.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeChange {
    Inserted(FlightRecord),
    /// `base_version` is the version the existing record had
    Updated { record: FlightRecord, base_version: u64 },
    Removed(FlightRecord),
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Full merged set, ordered by date then id
    pub records: Vec<FlightRecord>,
    pub summary: MergeSummary,
    pub removed: Vec<FlightRecord>,
    pub changed_dates: Vec<NaiveDate>,
    pub changes: Vec<MergeChange>,
}

pub struct MergeEngine;

impl MergeEngine {
    #[tracing::instrument(skip_all, fields(existing = existing.len(), imported = imported.len()))]
    pub fn merge(
        existing: &[FlightRecord],
        imported: &[FlightRecord],
        options: MergeOptions,
    ) -> Result<MergeOutcome, MergeError> {
        validate::validate(imported)?;

        let groups = period::group(imported);
        let main_period = period::main_period(&groups);
        let supplementary = imported.iter().any(|r| r.supplementary);
        let now = Utc::now();

        let mut summary = MergeSummary {
            main_period,
            periods: groups.keys().copied().collect(),
            ..Default::default()
        };
        let mut changes = Vec::new();
        let mut removed = Vec::new();

        // Untouched months pass through as is.
        let mut records: Vec<FlightRecord> = existing
            .iter()
            .filter(|r| !groups.contains_key(&r.period()))
            .cloned()
            .collect();
        let mut used_ids: HashSet<String> = existing.iter().map(|r| r.id.clone()).collect();

        for (period, batch) in &groups {
            let remove_missing = options.remove_missing && !supplementary && Some(*period) == main_period;

            let current: Vec<&FlightRecord> = existing.iter().filter(|r| r.period() == *period).collect();
            let mut by_key: HashMap<NaturalKey, &FlightRecord> = HashMap::new();
            for record in &current {
                by_key.entry(record.natural_key()).or_insert(*record);
            }
            let mut matched: HashSet<&str> = HashSet::new();

            for incoming in batch {
                match by_key.get(&incoming.natural_key()).copied() {
                    Some(found) if !matched.contains(found.id.as_str()) => {
                        matched.insert(found.id.as_str());
                        let mut merged = overlay(found, incoming);
                        if merged.same_content(found) {
                            summary.unchanged += 1;
                            records.push(found.clone());
                        } else {
                            merged.version = found.version + 1;
                            merged.last_modified = now;
                            summary.updated += 1;
                            changes.push(MergeChange::Updated {
                                record: merged.clone(),
                                base_version: found.version,
                            });
                            records.push(merged);
                        }
                    }
                    _ => {
                        let fresh = insert(incoming, &mut used_ids);
                        summary.inserted += 1;
                        changes.push(MergeChange::Inserted(fresh.clone()));
                        records.push(fresh);
                    }
                }
            }

            for record in current {
                if matched.contains(record.id.as_str()) {
                    continue;
                }
                if remove_missing {
                    summary.removed += 1;
                    changes.push(MergeChange::Removed(record.clone()));
                    removed.push(record.clone());
                } else {
                    records.push(record.clone());
                }
            }

            debug!(period = %period, remove_missing, batch = batch.len(), "Merged period");
        }

        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        let changed_dates = signature::changed_dates(&signature::by_date(existing), &signature::by_date(&records));

        metrics::record_merge(summary.inserted, summary.updated, summary.removed);
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            removed = summary.removed,
            main_period = ?summary.main_period,
            "Schedule merged"
        );

        Ok(MergeOutcome {
            records,
            summary,
            removed,
            changed_dates,
            changes,
        })
    }
}

/// Schedule fields from `incoming` over the user state of `existing`.
fn overlay(existing: &FlightRecord, incoming: &FlightRecord) -> FlightRecord {
    let mut merged = existing.clone();
    merged.flight_number = incoming.flight_number.clone();
    merged.airline = incoming.airline.clone();
    merged.route = incoming.route.clone();
    merged.departure = incoming.departure.clone();
    merged.arrival = incoming.arrival.clone();
    merged.std = incoming.std.clone();
    merged.sta = incoming.sta.clone();
    merged.departure_utc = incoming.departure_utc;
    merged.arrival_utc = incoming.arrival_utc;
    merged.show_up_utc = incoming.show_up_utc;
    merged.block_minutes = incoming.block_minutes;
    merged.aircraft_type = incoming.aircraft_type.clone();
    merged.registration = incoming.registration.clone();
    merged.schedule_type = incoming.schedule_type.clone();
    merged.crew = incoming.crew.clone();
    merged.cabin_crew = incoming.cabin_crew.clone();
    merged.monthly_total_block = incoming.monthly_total_block.clone();
    merged
}

fn insert(incoming: &FlightRecord, used_ids: &mut HashSet<String>) -> FlightRecord {
    let mut fresh = incoming.clone();
    let id = incoming.id.trim();
    fresh.id = if !id.is_empty() && !used_ids.contains(id) {
        id.to_string()
    } else {
        derive_id(&incoming.natural_key())
    };
    used_ids.insert(fresh.id.clone());

    fresh.status = FlightStatus::default();
    fresh.version = 1;
    fresh.last_modified = Utc::now();
    fresh.storage_path = Some(StoragePath::derive(fresh.date, &fresh.id));
    fresh
}

/// Stable id from the natural key, so re-importing yields the same id.
fn derive_id(key: &NaturalKey) -> String {
    let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
    format!("fl_{}", &digest[..20])
}
