//! Period grouping and main-period detection.
//!
//! A roster export usually covers one month but spills a day or two into
//! its neighbours. Only the month the file is really about may have records
//! removed, so every month in the batch gets a score and the highest one
//! wins.

use std::collections::BTreeMap;

use crate::record::{FlightRecord, Period};

/// Weight of a record carrying the monthly block-time total.
pub const TOTAL_MARKER_WEIGHT: u32 = 10;

/// Imported records by calendar month, chronological.
#[must_use]
pub fn group(records: &[FlightRecord]) -> BTreeMap<Period, Vec<&FlightRecord>> {
    let mut groups: BTreeMap<Period, Vec<&FlightRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.period()).or_default().push(record);
    }
    groups
}

fn weight(record: &FlightRecord) -> u32 {
    match record.monthly_total_block.as_deref() {
        Some(total) if !total.trim().is_empty() => TOTAL_MARKER_WEIGHT,
        _ => 1,
    }
}

#[must_use]
pub fn score(records: &[&FlightRecord]) -> u32 {
    records.iter().map(|r| weight(r)).sum()
}

/// Highest-scoring period; ties go to the later one.
#[must_use]
pub fn main_period(groups: &BTreeMap<Period, Vec<&FlightRecord>>) -> Option<Period> {
    let mut best: Option<(Period, u32)> = None;
    for (period, records) in groups {
        let s = score(records);
        if best.map_or(true, |(_, top)| s >= top) {
            best = Some((*period, s));
        }
    }
    best.map(|(period, _)| period)
}
