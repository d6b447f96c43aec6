//! Import validation. Runs before any record is touched.

use std::collections::HashSet;

use super::MergeError;
use crate::record::FlightRecord;

/// `H:MM` or `HH:MM`, 24-hour clock.
fn is_clock_time(s: &str) -> bool {
    let Some((h, m)) = s.trim().split_once(':') else {
        return false;
    };
    let digits = |p: &str, min: usize, max: usize| {
        (min..=max).contains(&p.len()) && p.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits(h, 1, 2) || !digits(m, 2, 2) {
        return false;
    }
    matches!((h.parse::<u32>(), m.parse::<u32>()), (Ok(h), Ok(m)) if h < 24 && m < 60)
}

/// Reject rows the merge could not place reliably.
pub fn validate(imported: &[FlightRecord]) -> Result<(), MergeError> {
    let mut seen = HashSet::new();

    for (index, record) in imported.iter().enumerate() {
        let malformed = |reason: String| MergeError::MalformedImport { index, reason };

        if record.schedule_type.trim().is_empty() {
            return Err(malformed("schedule type is empty".into()));
        }
        if record.is_flight_duty() && record.flight_number.trim().is_empty() {
            return Err(malformed("flight duty without flight number".into()));
        }
        for (label, time) in [("std", &record.std), ("sta", &record.sta)] {
            if let Some(t) = time {
                if !t.trim().is_empty() && !is_clock_time(t) {
                    return Err(malformed(format!("{} '{}' is not HH:MM", label, t)));
                }
            }
        }
        if !seen.insert(record.natural_key()) {
            return Err(malformed(format!("duplicate row {}", record.natural_key())));
        }
    }
    Ok(())
}
