//! Per-date change signatures.
//!
//! A date's signature is the sorted list of identifying lines of the
//! records on that date. Comparing signatures before and after a merge
//! tells the caller which days actually changed, independent of ids and
//! versions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::record::FlightRecord;

#[must_use]
pub fn by_date<'a, I>(records: I) -> BTreeMap<NaiveDate, String>
where
    I: IntoIterator<Item = &'a FlightRecord>,
{
    let mut lines: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    for record in records {
        lines.entry(record.date).or_default().push(record.signature_line());
    }
    lines
        .into_iter()
        .map(|(date, mut l)| {
            l.sort();
            (date, l.join("\n"))
        })
        .collect()
}

/// Dates whose signature differs, ascending.
#[must_use]
pub fn changed_dates(before: &BTreeMap<NaiveDate, String>, after: &BTreeMap<NaiveDate, String>) -> Vec<NaiveDate> {
    let dates: BTreeSet<&NaiveDate> = before.keys().chain(after.keys()).collect();
    dates
        .into_iter()
        .filter(|d| before.get(*d) != after.get(*d))
        .copied()
        .collect()
}
