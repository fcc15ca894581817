//! Manifest processing status
//!
//! Each manifest has exactly one status record, keyed by its descriptor object
//! key, moving only forward: `DISCOVERED -> STARTED -> COMPLETED`. The move to
//! `STARTED` is the claim that gives one job instance exclusive ownership of a
//! batch, so every store implements transitions as a single conditional write.

use async_trait::async_trait;
use ccw_common::types::RifFileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStatusStore;
pub use postgres::PgStatusStore;

/// Status shared by manifest and data file records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestStatus {
    Discovered,
    Started,
    Completed,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Discovered => "DISCOVERED",
            ManifestStatus::Started => "STARTED",
            ManifestStatus::Completed => "COMPLETED",
        }
    }

    /// Only single forward steps are legal.
    pub fn can_transition_to(&self, next: ManifestStatus) -> bool {
        matches!(
            (self, next),
            (ManifestStatus::Discovered, ManifestStatus::Started)
                | (ManifestStatus::Started, ManifestStatus::Completed)
        )
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManifestStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DISCOVERED" => Ok(ManifestStatus::Discovered),
            "STARTED" => Ok(ManifestStatus::Started),
            "COMPLETED" => Ok(ManifestStatus::Completed),
            other => Err(PipelineError::Config(format!(
                "Unknown manifest status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFileRecord {
    pub file_name: String,
    pub file_type: RifFileType,
    pub object_key: String,
    pub entry_index: i32,
    pub status: ManifestStatus,
    pub discovered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestRecord {
    pub manifest_key: String,
    pub manifest_timestamp: DateTime<Utc>,
    pub sequence_id: i32,
    pub status: ManifestStatus,
    pub discovered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last time the owning instance renewed its claim.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Empty when loaded through [`ManifestStatusStore::read_many`] or `list`.
    pub data_files: Vec<DataFileRecord>,
}

impl ManifestRecord {
    /// New `DISCOVERED` record with one data file row per manifest entry.
    ///
    /// Fails when the sequence id or the entry count does not fit the status
    /// tables' integer columns.
    pub fn discovered(manifest: &DataSetManifest, now: DateTime<Utc>) -> PipelineResult<Self> {
        let manifest_key = manifest.manifest_key();
        let sequence_id = i32::try_from(manifest.key().sequence_id())
            .map_err(|_| PipelineError::manifest_parse(&manifest_key, "sequence id out of range"))?;

        let data_files = manifest
            .entries()
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let entry_index = i32::try_from(index)
                    .map_err(|_| PipelineError::manifest_parse(&manifest_key, "too many entries"))?;
                Ok(DataFileRecord {
                    file_name: entry.name.clone(),
                    file_type: entry.file_type,
                    object_key: manifest.entry_key(entry),
                    entry_index,
                    status: ManifestStatus::Discovered,
                    discovered_at: now,
                    started_at: None,
                    completed_at: None,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(Self {
            manifest_key,
            manifest_timestamp: manifest.key().timestamp(),
            sequence_id,
            status: ManifestStatus::Discovered,
            discovered_at: now,
            started_at: None,
            heartbeat_at: None,
            completed_at: None,
            data_files,
        })
    }

    /// Most recent sign of life from the claim's owner.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        match (self.heartbeat_at, self.started_at) {
            (Some(beat), Some(started)) => Some(beat.max(started)),
            (beat, started) => beat.or(started),
        }
    }

    /// Whether a `STARTED` claim has gone longer than `timeout` without a
    /// heartbeat and may be taken over.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.status == ManifestStatus::Started
            && self.last_heartbeat().map_or(true, |beat| beat + timeout < now)
    }
}

pub(crate) fn illegal_transition(
    key: &str,
    from: ManifestStatus,
    to: ManifestStatus,
) -> PipelineError {
    PipelineError::IllegalTransition {
        key: key.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[async_trait]
pub trait ManifestStatusStore: Send + Sync {
    /// Record a newly seen manifest as `DISCOVERED` unless a record already
    /// exists; returns the stored record either way.
    async fn insert_discovered(
        &self,
        manifest: &DataSetManifest,
        now: DateTime<Utc>,
    ) -> PipelineResult<ManifestRecord>;

    async fn read(&self, manifest_key: &str) -> PipelineResult<Option<ManifestRecord>>;

    /// Records for the given keys, without data files. Unknown keys are absent
    /// from the map.
    async fn read_many(&self, manifest_keys: &[String])
        -> PipelineResult<HashMap<String, ManifestRecord>>;

    /// Move a record from `from` to `to` if, and only if, it is currently in
    /// `from`. Returns `false` when another writer got there first.
    async fn transition(
        &self,
        manifest_key: &str,
        from: ManifestStatus,
        to: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    /// Take over a `STARTED` record whose last heartbeat is older than
    /// `stale_before`. Resets both the start and heartbeat times to `now`.
    async fn reclaim_stale(
        &self,
        manifest_key: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool>;

    /// Renew the claim on a `STARTED` record. Returns `false` once the record
    /// is no longer `STARTED`.
    async fn heartbeat(&self, manifest_key: &str, now: DateTime<Utc>) -> PipelineResult<bool>;

    async fn update_data_file(
        &self,
        manifest_key: &str,
        file_name: &str,
        status: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<()>;

    /// Most recent manifests first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<ManifestStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<ManifestRecord>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        use ManifestStatus::*;
        assert!(Discovered.can_transition_to(Started));
        assert!(Started.can_transition_to(Completed));

        assert!(!Discovered.can_transition_to(Completed));
        assert!(!Started.can_transition_to(Discovered));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Completed.can_transition_to(Discovered));
        assert!(!Started.can_transition_to(Started));
    }

    #[test]
    fn test_status_text() {
        for status in [
            ManifestStatus::Discovered,
            ManifestStatus::Started,
            ManifestStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<ManifestStatus>().unwrap(), status);
        }
        assert_eq!("started".parse::<ManifestStatus>().unwrap(), ManifestStatus::Started);
        assert!("FAILED".parse::<ManifestStatus>().is_err());
    }

    #[test]
    fn test_discovered_rejects_sequence_id_beyond_column_range() {
        use crate::manifest::{DataSetLocation, ManifestKey};

        let now = Utc::now();
        let manifest = |seq: u32| {
            DataSetManifest::new(
                ManifestKey::new("Incoming", "2024-01-01T00:00:00Z", seq).unwrap(),
                DataSetLocation::regular(),
                false,
                Vec::new(),
            )
        };

        let record = ManifestRecord::discovered(&manifest(i32::MAX as u32), now).unwrap();
        assert_eq!(record.sequence_id, i32::MAX);

        let err = ManifestRecord::discovered(&manifest(i32::MAX as u32 + 1), now).unwrap_err();
        assert!(matches!(err, PipelineError::ManifestParse { .. }));
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let timeout = chrono::Duration::minutes(30);
        let mut record = ManifestRecord {
            manifest_key: "Incoming/x/0_manifest.xml".to_string(),
            manifest_timestamp: now,
            sequence_id: 0,
            status: ManifestStatus::Started,
            discovered_at: now,
            started_at: Some(now - chrono::Duration::minutes(10)),
            heartbeat_at: None,
            completed_at: None,
            data_files: vec![],
        };
        assert!(!record.is_stale(now, timeout));

        record.started_at = Some(now - chrono::Duration::minutes(31));
        assert!(record.is_stale(now, timeout));

        // A recent heartbeat keeps an old claim alive.
        record.heartbeat_at = Some(now - chrono::Duration::minutes(1));
        assert!(!record.is_stale(now, timeout));

        record.heartbeat_at = Some(now - chrono::Duration::minutes(45));
        assert!(record.is_stale(now, timeout));

        record.status = ManifestStatus::Completed;
        assert!(!record.is_stale(now, timeout));
    }
}
