//! Flight record data structure.
//!
//! The [`FlightRecord`] is the core data unit that flows through the engine:
//! cached in every tier, queued while offline, replayed to the remote store and
//! merged on schedule import.
//!
//! # Example
//!
//! ```
//! use flight_sync::FlightRecord;
//! use chrono::NaiveDate;
//!
//! let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
//! let record = FlightRecord::new("f-1", "oz 101", date).with_route("icn-nrt");
//!
//! assert_eq!(record.version, 1);
//! assert_eq!(record.natural_key().as_str(), "OZ101|2024-05-01|ICN-NRT|FLIGHT");
//! assert_eq!(record.resolved_storage_path().month, "05");
//! ```

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version of the persisted record shape.
///
/// Bumped whenever [`FlightRecord`] changes incompatibly. Tiers holding data
/// written under another version are rebuilt instead of migrated.
pub const SCHEMA_VERSION: u32 = 1;

/// Default schedule type for ordinary flight duties.
pub const SCHEDULE_FLIGHT: &str = "FLIGHT";

/// User-confirmed operational state.
///
/// Both flags describe real-world events that cannot be undone, so merges
/// combine them with OR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlightStatus {
    pub departed: bool,
    pub landed: bool,
}

impl FlightStatus {
    /// OR-merge: once a flag is true it stays true.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            departed: self.departed || other.departed,
            landed: self.landed || other.landed,
        }
    }

    #[must_use]
    pub fn is_unset(&self) -> bool {
        !self.departed && !self.landed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrewMember {
    pub employee_id: String,
    pub name: String,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub position_type: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// Remote location of a record: `users/{uid}/flights/{year}/{month}/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoragePath {
    pub year: i32,
    /// Zero-padded month, `"01"`..`"12"`
    pub month: String,
    pub remote_key: String,
}

impl StoragePath {
    /// Derive the path for a record from its date.
    #[must_use]
    pub fn derive(date: NaiveDate, remote_key: &str) -> Self {
        Self {
            year: date.year(),
            month: format!("{:02}", date.month()),
            remote_key: remote_key.to_string(),
        }
    }

    /// Full document path in the remote store.
    #[must_use]
    pub fn location(&self, user_id: &str) -> String {
        format!(
            "users/{}/flights/{}/{}/{}",
            user_id, self.year, self.month, self.remote_key
        )
    }
}

/// Calendar month a record belongs to. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Identity of a schedule entry across imports, independent of storage id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single duty on a crew member's schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub id: String,
    pub flight_number: String,
    #[serde(default)]
    pub airline: String,
    pub date: NaiveDate,
    /// Sector, e.g. `ICN-NRT`
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub departure: Option<String>,
    #[serde(default)]
    pub arrival: Option<String>,
    /// Scheduled departure, local `HH:MM`
    #[serde(default)]
    pub std: Option<String>,
    /// Scheduled arrival, local `HH:MM`
    #[serde(default)]
    pub sta: Option<String>,
    #[serde(default)]
    pub departure_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub arrival_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub show_up_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub block_minutes: Option<u32>,
    #[serde(default)]
    pub aircraft_type: Option<String>,
    #[serde(default)]
    pub registration: Option<String>,
    /// FLIGHT, RDO, STANDBY, ...
    #[serde(default = "default_schedule_type")]
    pub schedule_type: String,
    #[serde(default)]
    pub crew: Vec<CrewMember>,
    #[serde(default)]
    pub cabin_crew: Vec<CrewMember>,
    #[serde(default)]
    pub status: FlightStatus,
    /// User-set free text, preserved across imports
    #[serde(default)]
    pub memo: Option<String>,
    /// Monotonic, bumped on every local mutation
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    /// Month total block time (`HH:MM`), carried by one record per month
    #[serde(default)]
    pub monthly_total_block: Option<String>,
    /// Record comes from a supplementary (briefing) file
    #[serde(default)]
    pub supplementary: bool,
    #[serde(default)]
    pub storage_path: Option<StoragePath>,
}

fn default_schedule_type() -> String {
    SCHEDULE_FLIGHT.to_string()
}

/// Fields that make up "the content" of a record for change detection.
/// Bookkeeping (version, timestamps, storage location) is left out.
#[derive(Serialize)]
struct ContentView<'a> {
    flight_number: &'a str,
    airline: &'a str,
    date: NaiveDate,
    route: &'a str,
    departure: &'a Option<String>,
    arrival: &'a Option<String>,
    std: &'a Option<String>,
    sta: &'a Option<String>,
    departure_utc: &'a Option<DateTime<Utc>>,
    arrival_utc: &'a Option<DateTime<Utc>>,
    show_up_utc: &'a Option<DateTime<Utc>>,
    block_minutes: Option<u32>,
    aircraft_type: &'a Option<String>,
    registration: &'a Option<String>,
    schedule_type: &'a str,
    crew: &'a [CrewMember],
    cabin_crew: &'a [CrewMember],
    status: FlightStatus,
    memo: &'a Option<String>,
    monthly_total_block: &'a Option<String>,
    supplementary: bool,
}

impl FlightRecord {
    /// Create a new record with minimal required fields.
    pub fn new(id: impl Into<String>, flight_number: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            id: id.into(),
            flight_number: flight_number.into(),
            airline: String::new(),
            date,
            route: String::new(),
            departure: None,
            arrival: None,
            std: None,
            sta: None,
            departure_utc: None,
            arrival_utc: None,
            show_up_utc: None,
            block_minutes: None,
            aircraft_type: None,
            registration: None,
            schedule_type: default_schedule_type(),
            crew: Vec::new(),
            cabin_crew: Vec::new(),
            status: FlightStatus::default(),
            memo: None,
            version: 1,
            last_modified: Utc::now(),
            monthly_total_block: None,
            supplementary: false,
            storage_path: None,
        }
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        if let Some((dep, arr)) = self.route.split_once('-') {
            self.departure = Some(dep.trim().to_uppercase());
            self.arrival = Some(arr.trim().to_uppercase());
        }
        self
    }

    #[must_use]
    pub fn with_airline(mut self, airline: impl Into<String>) -> Self {
        self.airline = airline.into();
        self
    }

    #[must_use]
    pub fn with_times(mut self, std: &str, sta: &str) -> Self {
        self.std = Some(std.to_string());
        self.sta = Some(sta.to_string());
        self
    }

    #[must_use]
    pub fn with_monthly_total(mut self, total: impl Into<String>) -> Self {
        self.monthly_total_block = Some(total.into());
        self
    }

    #[must_use]
    pub fn as_supplementary(mut self) -> Self {
        self.supplementary = true;
        self
    }

    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey(format!(
            "{}|{}|{}|{}",
            normalize(&self.flight_number),
            self.date,
            normalize(&self.route),
            normalize(&self.schedule_type),
        ))
    }

    #[must_use]
    pub fn period(&self) -> Period {
        Period::of(self.date)
    }

    /// Storage path of the record, derived from the date when unset.
    #[must_use]
    pub fn resolved_storage_path(&self) -> StoragePath {
        self.storage_path
            .clone()
            .unwrap_or_else(|| StoragePath::derive(self.date, &self.id))
    }

    /// Fill in the storage path if missing.
    pub fn ensure_storage_path(&mut self) -> &StoragePath {
        let (date, id) = (self.date, &self.id);
        self.storage_path.get_or_insert_with(|| StoragePath::derive(date, id))
    }

    /// SHA-256 over the content fields, hex encoded.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let view = ContentView {
            flight_number: &self.flight_number,
            airline: &self.airline,
            date: self.date,
            route: &self.route,
            departure: &self.departure,
            arrival: &self.arrival,
            std: &self.std,
            sta: &self.sta,
            departure_utc: &self.departure_utc,
            arrival_utc: &self.arrival_utc,
            show_up_utc: &self.show_up_utc,
            block_minutes: self.block_minutes,
            aircraft_type: &self.aircraft_type,
            registration: &self.registration,
            schedule_type: &self.schedule_type,
            crew: &self.crew,
            cabin_crew: &self.cabin_crew,
            status: self.status,
            memo: &self.memo,
            monthly_total_block: &self.monthly_total_block,
            supplementary: self.supplementary,
        };
        // ContentView only holds plain data, serialization cannot fail
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.content_hash() == other.content_hash()
    }

    /// Record a local mutation: bump version and stamp the time.
    pub fn touch(&mut self) {
        self.version += 1;
        self.last_modified = Utc::now();
    }

    pub fn set_status(&mut self, status: FlightStatus) {
        self.status = status;
        self.touch();
    }

    pub fn mark_departed(&mut self) {
        self.set_status(FlightStatus { departed: true, ..self.status });
    }

    pub fn mark_landed(&mut self) {
        self.set_status(FlightStatus { landed: true, ..self.status });
    }

    pub fn set_memo(&mut self, memo: Option<String>) {
        self.memo = memo;
        self.touch();
    }

    /// Whether this is a flight duty (as opposed to RDO, standby, ...).
    #[must_use]
    pub fn is_flight_duty(&self) -> bool {
        normalize(&self.schedule_type) == SCHEDULE_FLIGHT
    }

    /// Identifying fields used for per-date change signatures.
    #[must_use]
    pub fn signature_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            normalize(&self.flight_number),
            normalize(&self.route),
            self.std.as_deref().unwrap_or(""),
            self.sta.as_deref().unwrap_or(""),
            normalize(&self.schedule_type),
        )
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_uppercase().replace(' ', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_new_record_defaults() {
        let record = FlightRecord::new("f-1", "OZ101", date(2024, 5, 1));

        assert_eq!(record.version, 1);
        assert_eq!(record.schedule_type, SCHEDULE_FLIGHT);
        assert!(record.status.is_unset());
        assert!(record.storage_path.is_none());
        assert!(!record.supplementary);
    }

    #[test]
    fn test_natural_key_normalizes() {
        let a = FlightRecord::new("a", " oz 101", date(2024, 5, 1)).with_route("icn-nrt");
        let b = FlightRecord::new("b", "OZ101", date(2024, 5, 1)).with_route("ICN-NRT");
        assert_eq!(a.natural_key(), b.natural_key());

        let other_day = FlightRecord::new("c", "OZ101", date(2024, 5, 2)).with_route("ICN-NRT");
        assert_ne!(a.natural_key(), other_day.natural_key());
    }

    #[test]
    fn test_with_route_splits_sector() {
        let record = FlightRecord::new("f", "OZ1", date(2024, 5, 1)).with_route("icn-lax");
        assert_eq!(record.departure.as_deref(), Some("ICN"));
        assert_eq!(record.arrival.as_deref(), Some("LAX"));
    }

    #[test]
    fn test_storage_path_derived_from_date() {
        let record = FlightRecord::new("key-9", "OZ1", date(2024, 3, 9));
        let path = record.resolved_storage_path();

        assert_eq!(path.year, 2024);
        assert_eq!(path.month, "03");
        assert_eq!(path.remote_key, "key-9");
        assert_eq!(path.location("u1"), "users/u1/flights/2024/03/key-9");
    }

    #[test]
    fn test_ensure_storage_path_keeps_existing() {
        let mut record = FlightRecord::new("id", "OZ1", date(2024, 3, 9));
        record.storage_path = Some(StoragePath {
            year: 2023,
            month: "12".into(),
            remote_key: "legacy".into(),
        });
        assert_eq!(record.ensure_storage_path().remote_key, "legacy");

        let mut fresh = FlightRecord::new("id2", "OZ1", date(2024, 3, 9));
        assert_eq!(fresh.ensure_storage_path().remote_key, "id2");
        assert!(fresh.storage_path.is_some());
    }

    #[test]
    fn test_period_ordering_and_display() {
        let dec = Period { year: 2023, month: 12 };
        let jan = Period { year: 2024, month: 1 };
        assert!(dec < jan);
        assert_eq!(jan.to_string(), "2024-01");
        assert!(jan.contains(date(2024, 1, 31)));
        assert!(!jan.contains(date(2024, 2, 1)));
    }

    #[test]
    fn test_content_hash_ignores_bookkeeping() {
        let a = FlightRecord::new("a", "OZ1", date(2024, 5, 1));
        let mut b = a.clone();
        b.version = 42;
        b.last_modified = Utc::now();
        b.storage_path = Some(StoragePath::derive(b.date, "x"));
        assert!(a.same_content(&b));

        b.route = "ICN-NRT".into();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_status_mutations_bump_version() {
        let mut record = FlightRecord::new("a", "OZ1", date(2024, 5, 1));
        record.mark_departed();
        assert_eq!(record.version, 2);
        assert!(record.status.departed);

        record.mark_landed();
        assert_eq!(record.version, 3);
        assert!(record.status.departed && record.status.landed);
    }

    #[test]
    fn test_status_merge_is_or() {
        let a = FlightStatus { departed: true, landed: false };
        let b = FlightStatus { departed: false, landed: true };
        assert_eq!(a.merge(b), FlightStatus { departed: true, landed: true });
        assert_eq!(FlightStatus::default().merge(FlightStatus::default()), FlightStatus::default());
    }

    #[test]
    fn test_serialize_roundtrip_with_defaults() {
        let json = r#"{
            "id": "f-1",
            "flight_number": "OZ101",
            "date": "2024-05-01",
            "version": 3,
            "last_modified": "2024-05-01T00:00:00Z"
        }"#;
        let record: FlightRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.schedule_type, "FLIGHT");
        assert!(record.crew.is_empty());
        assert_eq!(record.version, 3);

        let back: FlightRecord = serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
