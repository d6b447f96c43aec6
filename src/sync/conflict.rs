//! Version conflict detection and resolution.
//!
//! A conflict exists only when both sides moved past the common base
//! version and ended up with different content. Resolution always produces
//! a record whose version is above both sides, so every device converges on
//! the resolved copy.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::record::FlightRecord;

/// How a record changed relative to a known base version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeClass {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    Conflict,
}

/// Concurrent divergent modification of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub record_id: String,
    /// Version both sides started from
    pub base_version: u64,
    pub local_version: u64,
    pub remote_version: u64,
    pub local_record: FlightRecord,
    pub remote_record: FlightRecord,
    /// The local side is a pending delete
    pub local_deleted: bool,
}

impl ConflictInfo {
    #[must_use]
    pub fn new(base_version: u64, local: FlightRecord, remote: FlightRecord) -> Self {
        Self {
            record_id: local.id.clone(),
            base_version,
            local_version: local.version,
            remote_version: remote.version,
            local_record: local,
            remote_record: remote,
            local_deleted: false,
        }
    }

    /// Version a resolution of this conflict must carry.
    #[must_use]
    pub fn resolved_version(&self) -> u64 {
        self.local_version.max(self.remote_version) + 1
    }
}

/// An explicit user decision for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    Local,
    Remote,
}

/// Final record for a conflict, ready to be written remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub record_id: String,
    pub record: FlightRecord,
}

pub struct ConflictResolver;

impl ConflictResolver {
    #[must_use]
    pub fn classify(base_version: u64, local: &FlightRecord, remote: &FlightRecord) -> ChangeClass {
        let local_changed = local.version > base_version;
        let remote_changed = remote.version > base_version;
        match (local_changed, remote_changed) {
            (false, false) => ChangeClass::Unchanged,
            (true, false) => ChangeClass::LocalOnly,
            (false, true) => ChangeClass::RemoteOnly,
            (true, true) if local.same_content(remote) => ChangeClass::Unchanged,
            (true, true) => ChangeClass::Conflict,
        }
    }

    /// Classify a whole local set against the remote snapshot.
    ///
    /// Records without a known base, or missing on either side, never
    /// conflict.
    #[must_use]
    pub fn detect(
        local_records: &[FlightRecord],
        remote_records: &[FlightRecord],
        base_versions: &HashMap<String, u64>,
    ) -> Vec<ConflictInfo> {
        let remote_by_id: HashMap<&str, &FlightRecord> =
            remote_records.iter().map(|r| (r.id.as_str(), r)).collect();

        local_records
            .iter()
            .filter_map(|local| {
                let remote = remote_by_id.get(local.id.as_str())?;
                let base = *base_versions.get(&local.id)?;
                (Self::classify(base, local, remote) == ChangeClass::Conflict)
                    .then(|| ConflictInfo::new(base, local.clone(), (*remote).clone()))
            })
            .collect()
    }

    /// Automatic resolution: the later write wins field by field, except
    /// completion flags, which are never lost.
    #[must_use]
    pub fn resolve_default(conflict: &ConflictInfo) -> FlightRecord {
        let (winner, loser) = if conflict.local_record.last_modified >= conflict.remote_record.last_modified {
            (&conflict.local_record, &conflict.remote_record)
        } else {
            (&conflict.remote_record, &conflict.local_record)
        };

        let mut resolved = winner.clone();
        resolved.status = winner.status.merge(loser.status);
        if resolved.storage_path.is_none() {
            resolved.storage_path = loser.storage_path.clone();
        }
        resolved.version = conflict.resolved_version();
        resolved
    }

    /// Resolution from an explicit choice. The chosen side is taken as is.
    #[must_use]
    pub fn apply_choice(conflict: &ConflictInfo, choice: Choice) -> FlightRecord {
        let (chosen, other) = match choice {
            Choice::Local => (&conflict.local_record, &conflict.remote_record),
            Choice::Remote => (&conflict.remote_record, &conflict.local_record),
        };

        let mut resolved = chosen.clone();
        if resolved.storage_path.is_none() {
            resolved.storage_path = other.storage_path.clone();
        }
        resolved.version = conflict.resolved_version();
        resolved.last_modified = Utc::now();
        resolved
    }
}

/// Decides conflicts surfaced by a sync pass.
///
/// Conflicts missing from the returned list stay queued for the next pass.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, conflicts: &[ConflictInfo]) -> Vec<ResolvedRecord>;
}

/// Resolve everything with [`ConflictResolver::resolve_default`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolution;

#[async_trait]
impl ConflictHandler for DefaultResolution {
    async fn resolve(&self, conflicts: &[ConflictInfo]) -> Vec<ResolvedRecord> {
        conflicts
            .iter()
            .map(|c| ResolvedRecord {
                record_id: c.record_id.clone(),
                record: ConflictResolver::resolve_default(c),
            })
            .collect()
    }
}

/// Apply the same choice to every conflict ("keep mine" / "take theirs").
#[derive(Debug, Clone, Copy)]
pub struct ChoiceResolution(pub Choice);

#[async_trait]
impl ConflictHandler for ChoiceResolution {
    async fn resolve(&self, conflicts: &[ConflictInfo]) -> Vec<ResolvedRecord> {
        conflicts
            .iter()
            .map(|c| ResolvedRecord {
                record_id: c.record_id.clone(),
                record: ConflictResolver::apply_choice(c, self.0),
            })
            .collect()
    }
}
