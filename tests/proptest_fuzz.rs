//! Property-based tests (fuzzing) for schedule merging and record hashing.
//!
//! Uses proptest to generate rosters, valid and malformed, and checks that
//! merging never panics and keeps its guarantees: idempotence, untouched
//! months, removal confined to the main period, unique ids.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use proptest::prelude::*;

use flight_sync::{FlightRecord, MergeEngine, MergeError, MergeOptions, Period};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn time_strategy() -> impl Strategy<Value = String> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| format!("{h:02}:{m:02}"))
}

/// A well-formed record in one of four consecutive months.
fn record_strategy() -> impl Strategy<Value = FlightRecord> {
    (
        "[A-Z]{2}[0-9]{1,4}",
        9u32..=12,
        1u32..=28,
        prop::sample::select(vec!["ICN-NRT", "GMP-CJU", "ICN-LAX", "PUS-KIX"]),
        time_strategy(),
        time_strategy(),
        prop::option::weighted(0.2, "[0-9]{2}:[0-5][0-9]"),
    )
        .prop_map(|(number, month, day, route, std, sta, total)| {
            let date = NaiveDate::from_ymd_opt(2025, month, day).unwrap();
            let mut record = FlightRecord::new("", number, date)
                .with_route(route)
                .with_times(&std, &sta);
            record.monthly_total_block = total;
            record
        })
}

/// Valid roster: natural keys are unique.
fn roster_strategy(max: usize) -> impl Strategy<Value = Vec<FlightRecord>> {
    prop::collection::vec(record_strategy(), 0..max).prop_map(|records| {
        let mut seen = HashSet::new();
        records
            .into_iter()
            .filter(|r| seen.insert(r.natural_key()))
            .collect()
    })
}

/// Roster with arbitrary junk in the validated fields.
fn junk_roster_strategy() -> impl Strategy<Value = Vec<FlightRecord>> {
    prop::collection::vec(
        (record_strategy(), ".{0,6}", ".{0,6}", ".{0,3}", ".{0,4}"),
        0..12,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(mut record, std, sta, schedule_type, number)| {
                record.std = Some(std);
                record.sta = Some(sta);
                record.schedule_type = schedule_type;
                record.flight_number = number;
                record
            })
            .collect()
    })
}

fn assign_ids(records: Vec<FlightRecord>) -> Vec<FlightRecord> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, mut r)| {
            r.id = format!("existing-{i}");
            r
        })
        .collect()
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Garbage never panics: either a merge or a clean MalformedImport.
    #[test]
    fn merge_never_panics_on_junk(
        existing in roster_strategy(10),
        imported in junk_roster_strategy(),
        remove_missing in any::<bool>(),
    ) {
        let existing = assign_ids(existing);
        match MergeEngine::merge(&existing, &imported, MergeOptions { remove_missing }) {
            Ok(outcome) => {
                let ids: HashSet<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
                prop_assert_eq!(ids.len(), outcome.records.len());
            }
            Err(MergeError::MalformedImport { index, .. }) => prop_assert!(index < imported.len()),
        }
    }

    /// Importing the merged result's own roster again changes nothing.
    #[test]
    fn merge_is_idempotent(
        existing in roster_strategy(12),
        imported in roster_strategy(12),
        remove_missing in any::<bool>(),
    ) {
        let existing = assign_ids(existing);
        let options = MergeOptions { remove_missing };
        let first = MergeEngine::merge(&existing, &imported, options).unwrap();
        let second = MergeEngine::merge(&first.records, &imported, options).unwrap();

        prop_assert!(second.changes.is_empty(), "changes: {:?}", second.changes);
        prop_assert_eq!(second.summary.inserted, 0);
        prop_assert_eq!(second.summary.removed, 0);
        prop_assert!(second.changed_dates.is_empty());

        let before: HashMap<_, _> = first.records.iter().map(|r| (r.id.clone(), r.content_hash())).collect();
        let after: HashMap<_, _> = second.records.iter().map(|r| (r.id.clone(), r.content_hash())).collect();
        prop_assert_eq!(before, after);
    }

    /// Months the roster does not mention pass through untouched.
    #[test]
    fn untouched_months_are_preserved(
        existing in roster_strategy(16),
        imported in roster_strategy(8),
    ) {
        let existing = assign_ids(existing);
        let outcome = MergeEngine::merge(&existing, &imported, MergeOptions { remove_missing: true }).unwrap();
        let imported_periods: HashSet<Period> = imported.iter().map(|r| r.period()).collect();

        for record in existing.iter().filter(|r| !imported_periods.contains(&r.period())) {
            let kept = outcome.records.iter().find(|r| r.id == record.id);
            prop_assert!(kept.is_some(), "lost {}", record.id);
            let kept = kept.unwrap();
            prop_assert_eq!(kept.version, record.version);
            prop_assert!(kept.same_content(record));
        }
    }

    /// Removal only ever happens inside the main period, and never for
    /// supplementary imports.
    #[test]
    fn removal_confined_to_main_period(
        existing in roster_strategy(16),
        imported in roster_strategy(8),
        supplementary in any::<bool>(),
    ) {
        let existing = assign_ids(existing);
        let imported: Vec<_> = if supplementary {
            imported.into_iter().map(FlightRecord::as_supplementary).collect()
        } else {
            imported
        };
        let outcome = MergeEngine::merge(&existing, &imported, MergeOptions { remove_missing: true }).unwrap();

        if supplementary {
            prop_assert!(outcome.removed.is_empty());
        }
        for removed in &outcome.removed {
            prop_assert_eq!(Some(removed.period()), outcome.summary.main_period);
        }
        prop_assert_eq!(
            outcome.records.len() + outcome.removed.len(),
            existing.len() + outcome.summary.inserted
        );
    }

    /// Without removeMissing nothing existing is ever dropped.
    #[test]
    fn no_removal_without_flag(
        existing in roster_strategy(16),
        imported in roster_strategy(8),
    ) {
        let existing = assign_ids(existing);
        let outcome = MergeEngine::merge(&existing, &imported, MergeOptions::default()).unwrap();
        prop_assert!(outcome.removed.is_empty());
        let ids: HashSet<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        for record in &existing {
            prop_assert!(ids.contains(record.id.as_str()));
        }
    }

    /// Version and timestamps never change the content hash.
    #[test]
    fn content_hash_ignores_bookkeeping(record in record_strategy(), bump in 1u64..50) {
        let mut touched = record.clone();
        touched.version += bump;
        touched.last_modified = touched.last_modified + chrono::TimeDelta::seconds(bump as i64);
        touched.ensure_storage_path();
        prop_assert_eq!(record.content_hash(), touched.content_hash());

        let mut edited = record.clone();
        edited.memo = Some("changed".into());
        prop_assert_ne!(record.content_hash(), edited.content_hash());
    }
}
